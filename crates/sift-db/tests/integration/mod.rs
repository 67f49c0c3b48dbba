pub mod common;

mod claim_tests;
