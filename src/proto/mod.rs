//! Protocol dispatch. HTTP/1.x is the only protocol spoken.

pub(crate) mod h1;
