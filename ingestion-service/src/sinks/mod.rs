pub mod questdb;
pub mod questdb_ilp;

pub use questdb::{PointWriter, QuestDbPgWriter, QuestDbStore};
pub use questdb_ilp::QuestDbIlpWriter;
