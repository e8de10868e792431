pub mod credential;
pub mod loaders;
pub mod query;
pub mod record;

pub use credential::{Credential, CredentialPool};
pub use loaders::load_records;
pub use query::Query;
pub use record::{Provenance, Record, RecordSeed, RecordSet};
