//! Study participants

use crate::scheduler::Group;
use serde::{Deserialize, Serialize};

/// A registered participant, identified by their access code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub access_code: String,
    pub first_name: String,
    pub last_name: String,
    pub group: Group,
}

impl Participant {
    pub fn new(
        access_code: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        group: Group,
    ) -> Self {
        Self {
            access_code: access_code.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            group,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
