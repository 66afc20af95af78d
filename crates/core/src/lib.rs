//! Insomnia core: keep-alive tone domain logic
//!
//! Everything in here is platform-agnostic. Host audio access lives in
//! `insomnia-infra` behind the [`domain::audio`] traits.

pub mod domain;
