#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{FakeProvider, IssuerBuilder, PolicyFile};
pub use db::TestDb;
