use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Matches a string by exactly one of an exact value, a prefix, or a
/// regular expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}
