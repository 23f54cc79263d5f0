mod database;
mod sink;
mod upstream;

pub(crate) use database::test_database;
pub(crate) use sink::MemorySink;
pub(crate) use upstream::MockFhirServer;
