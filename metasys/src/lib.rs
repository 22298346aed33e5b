/*!
`metasys` turns a binary package repository into an AppStream component
catalog plus the media (icons, screenshot renders, font previews) the catalog
references.

The generator walks every (suite, section, architecture) combination of the
configured archive, extracts metainfo and desktop-entry files from the
packages found there, resolves icons across the whole package set, and
persists each finished component under a content-derived global ID. A durable
store keeps per-package state so that subsequent runs only touch packages
that actually changed, and a garbage collection pass drops metadata and media
no surviving package refers to.

Currently implemented:
* metainfo / desktop-entry extraction with cross-file merging
* XDG-theme-aware icon resolution over the union of all packages
* locale, font and screenshot/video post-processing
* deterministic XML and DEP-11 YAML catalog export
* cruft collection over the store and the media pool

Configuration comes from a TOML file in the workspace directory; see the
`metasys-config` crate for the recognized keys.
*/

#![deny(rust_2018_idioms)]

pub mod backend;
pub mod cmd;
pub mod common;
pub mod component;
pub mod contents;
pub mod desktop;
pub mod extractor;
pub mod handlers;
pub mod hints;
pub mod icons;
pub mod metainfo;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod result;
pub mod store;
