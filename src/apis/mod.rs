pub mod backup_types;
pub mod documentdb_types;
