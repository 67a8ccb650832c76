//! Owner references into the four-level administrative hierarchy
use std::fmt;

/// A position in the administrative hierarchy that can hold vaccine
/// inventory. The national level is a singleton; every other level
/// carries the identifier of its instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Owner {
    #[n(0)]
    National,
    #[n(1)]
    Regional {
        #[n(0)]
        id: String,
    },
    #[n(2)]
    District {
        #[n(0)]
        id: String,
    },
    #[n(3)]
    HealthCenter {
        #[n(0)]
        id: String,
    },
}

impl Owner {
    pub fn regional(id: impl Into<String>) -> Self {
        Self::Regional { id: id.into() }
    }
    pub fn district(id: impl Into<String>) -> Self {
        Self::District { id: id.into() }
    }
    pub fn health_center(id: impl Into<String>) -> Self {
        Self::HealthCenter { id: id.into() }
    }
    /// Stable segment used when composing sled keys. Owner equality and
    /// key-segment equality must always agree.
    pub(crate) fn key_segment(&self) -> String {
        match self {
            Owner::National => "n".to_string(),
            Owner::Regional { id } => format!("r:{id}"),
            Owner::District { id } => format!("d:{id}"),
            Owner::HealthCenter { id } => format!("h:{id}"),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::National => write!(f, "national"),
            Owner::Regional { id } => write!(f, "region/{id}"),
            Owner::District { id } => write!(f, "district/{id}"),
            Owner::HealthCenter { id } => write!(f, "health-center/{id}"),
        }
    }
}
