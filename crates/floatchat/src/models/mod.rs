pub mod query_envelope;
pub mod response;

pub use response::{ASK_RESPONSE_SCHEMA_VERSION, AskResponse, QuerySource, json_schema};
