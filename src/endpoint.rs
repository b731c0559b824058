use serde::{Deserialize, Serialize};

/// An inference replica. Identity is `url`, unique within a snapshot of
/// the endpoint list handed to a single `route_request` call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
	pub url: String,
}

impl Endpoint {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}
}

impl From<&str> for Endpoint {
	fn from(url: &str) -> Self {
		Self::new(url)
	}
}

impl std::fmt::Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.url)
	}
}
