//! End-to-end tests for the trust issuance pipeline
//!
//! This test suite validates:
//! - PSAT attestation evidence feeding the registry
//! - Registration of workloads under the attested agent
//! - JWT-SVID issuance for registered workloads
//! - Caller-side deadlines around the synchronous attestation path

pub mod test_utils;

#[cfg(test)]
mod pipeline_tests;
