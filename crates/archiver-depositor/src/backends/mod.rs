//! Concrete depositor backends.
//!
//! [`zenodo`] is the DOI-repository backend used in production. [`path`] is
//! a path-addressed filesystem backend useful for local testing and for
//! datasets archived to a plain directory tree. [`object_store`] is the
//! minimal, non-versioned object-store-plus-metadata-database backend: it
//! writes objects and unpacks ZIP members but has no database to back
//! checksum lookups or a second deposition version.

pub mod object_store;
pub mod path;
pub mod zenodo;
