//! Host audio access for Insomnia

pub mod audio;
