// store/ - Durable mention → canonical entry mappings (SQLite).
//
// `original` is unique; everything else about a mapping is looked up through
// secondary indexes (matched name, score, food group).

pub mod db;

pub use db::{MappingStore, OnDuplicate, StoreError, WriteMode};
