//! Cross-crate integration tests

#[cfg(test)]
mod coordination_integration;
