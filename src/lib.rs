// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests use unwrap and panic freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! An infrastructure-as-code deployment engine. Given the desired resources
//! of a program and the snapshot of what was last deployed, Converge works
//! out a dependency-safe plan of create, update, replace and delete steps,
//! and can execute that plan through a provider.
//!
//! ## Overview
//!
//! A planning run:
//!
//! 1. **Decodes** every desired resource against its type schema, collecting
//!    every field failure before reporting.
//! 2. **Builds** the desired and prior resource graphs and sorts them
//!    topologically, rejecting cycles and dangling references.
//! 3. **Classifies** each resource as same, update, replace, create or delete
//!    using the declared mutability of each changed property.
//! 4. **Cascades** replacements to every resource that references a replaced
//!    one.
//! 5. **Orders** the steps so dependencies are created first and deleted
//!    last, with a fingerprint identifying the plan.
//! 6. **Analyzes** the desired graph with the registered policy analyzers.
//!
//! Applying executes the steps concurrently where the plan allows it,
//! recording every completed step in the snapshot before its dependents start.
//!
//! ## Modules
//!
//! - [`resource`]: Property values, URNs, schemas and the decoder
//! - [`catalog`]: Built-in resource schemas
//! - [`graph`]: Resource graph and topological ordering
//! - [`planner`]: Diff classification, replacement cascade, plans and execution
//! - [`analyzer`]: Policy analyzers and the gateway that runs them
//! - [`provider`]: Provider interface used during execution
//! - [`state`]: Snapshot storage backends (local, S3, memory)
//! - [`manifest`]: File-backed program evaluator
//! - [`config`]: Configuration parsing and validation
//! - [`engine`]: Plan and apply orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - type: aws:iam/role:Role
//!     name: app
//!     properties:
//!       assumeRolePolicyDocument: {}
//!       path: /service/
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod analyzer;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod planner;
pub mod provider;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use analyzer::{Analyzer, AnalyzerGateway};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use engine::{ApplyOutcome, Engine, PlanOutcome};
pub use error::{ConvergeError, Result};
pub use graph::ResourceGraph;
pub use manifest::{ManifestEvaluator, ProgramEvaluator};
pub use planner::{Plan, PlanBuilder, StepExecutor};
pub use provider::Provider;
pub use resource::{PropertyMap, PropertyValue, Resource, SchemaRegistry, Urn};
pub use state::{LocalSnapshotStore, S3SnapshotStore, Snapshot, SnapshotStore};
