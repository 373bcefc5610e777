use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A unary reply from an interpreter worker.
///
/// Every field is optional on the wire; a worker that omits `status` (or
/// sends 0) means 200.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl ResponsePayload {
    /// The effective HTTP status: 0 is treated as 200.
    pub fn status_or_default(&self) -> u16 {
        if self.status == 0 {
            200
        } else {
            self.status
        }
    }
}
