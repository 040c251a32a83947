pub mod cloudstorage_types;
pub mod dpa_types;
pub mod velero_types;
