pub(crate) use any2json_domain::storage::StorageError;
