pub mod challenge;
pub mod claims;
pub mod exchange;
pub mod presentation_definition;
pub mod relying_party;
pub mod util;
pub mod workflow;
