//! Library and binaries for unpacking and repacking Android partition images.
//!
//! ## Library
//! Add the following to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! partimg = "0.1.0"
//! ```
//!
//! ### Unpacking
//! [`FirmwareIntake`] takes the partition files out of a firmware zip, dumping `payload.bin`
//! when there is one. [`Classifier`] recognizes the container and filesystem of an image,
//! [`Pipeline`] decodes it down to a raw filesystem and [`Describer`] extracts the tree and
//! writes the three metadata artifacts: file contexts, filesystem config and filesystem
//! features. [`Unpacker`] runs all of them over a directory of firmware files.
//!
//! ### Repacking
//! [`RebuildPlanner`] reads the artifacts back, builds a raw ext4 image with `mke2fs` and
//! `e2fsdroid`, then encodes it to sparse and brotli compressed transfer-list form.
//!
//!### Example
//!```rust,no_run
//! # use std::path::Path;
//! # use std::sync::Arc;
//! # use partimg::{Classifier, Config, Pipeline, ProcessRunner, PartitionSource};
//! let config = Config::with_project("rom");
//! let runner = Arc::new(ProcessRunner);
//!
//! let class = Classifier::new(&config).classify_file(Path::new("rom/source/vendor.img")).unwrap();
//! println!("{} / {}", class.container, class.filesystem);
//!
//! let pipeline = Pipeline::new(&config, runner);
//! let decoded = pipeline.decode(&PartitionSource::single("vendor", "rom/source/vendor.img")).unwrap();
//! ```
//!
//! # Features
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod archive;
pub mod classify;
pub mod config;
pub mod describe;
pub mod erofs;
pub mod error;
pub mod ext4;
pub mod introspect;
mod kinds;
pub mod mode;
pub mod partition;
pub mod pipeline;
pub mod rebuild;
pub mod rominfo;
pub mod session;
pub mod sparse;
pub mod synth;
pub mod tool;

pub use crate::archive::{FirmwareIntake, Intake, MemberRole};
pub use crate::classify::{classify, discover, Classification, Classifier, PartitionSource, SourceLayout};
pub use crate::config::{Config, ToolPaths};
pub use crate::describe::{Describer, Description};
pub use crate::error::{PartimgError, PartitionFailure, Stage};
pub use crate::introspect::{FilesystemFeatures, InodeRecord, NodeKind, Walk, WalkCounts};
pub use crate::kinds::{ContainerKind, FilesystemKind};
pub use crate::partition::{Partition, PartitionKind};
pub use crate::pipeline::{Decoded, DecodeStep, PartitionImage, Pipeline, TransformKind};
pub use crate::rebuild::RebuildPlanner;
pub use crate::rominfo::RomInfo;
pub use crate::session::{RunReport, Unpacker};
pub use crate::synth::{Artifacts, FeatureSheet};
pub use crate::tool::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
