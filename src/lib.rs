//! # Open Locator
//!
//! Finds freely readable copies of published works and picks the best one.
//!
//! Open Locator harvests repository records over OAI-PMH, scrapes the
//! harvested landing pages for full text, and combines that with journal
//! allow-lists, license metadata, and manual overrides into one ranked,
//! consolidated answer per work. All long-running work is driven by leased
//! queues in SQLite, so any number of worker processes can share a database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Endpoints  │──▶│    Pages     │──▶│  SQLite   │
//! │  (harvest)  │   │  (scrape)    │   │  queues   │
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │  Works   │──────▶│  Ranked  │
//!                 │(evidence)│       │  result  │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! olo init                                  # create database
//! olo rules load rules.toml                 # journal and license tables
//! olo endpoint add https://export.arxiv.org/oai2
//! olo queue endpoints --run --drain         # harvest
//! olo queue pages --dynos 4                 # scrape
//! olo add 10.1234/example
//! olo queue works --run --drain             # recalculate
//! olo show 10.1234/example
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`lease`] | Lease store: claim, finish, kick, backlog |
//! | [`queue`] | The named work queues |
//! | [`runner`] | Chunked job runner and operation dispatch |
//! | [`harvest`] | OAI-PMH windowing, parsing, and paging |
//! | [`scrape`] | Landing-page scrapers and the copyright probe |
//! | [`scrape_pool`] | Bounded concurrent scrape pool |
//! | [`evidence`] | Evidence strategies for one work |
//! | [`ranker`] | Location scoring, version rules, consolidation |
//! | [`rules`] | Journal, license, and override tables |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod biblio;
pub mod config;
pub mod db;
pub mod dynos;
pub mod endpoints;
pub mod error;
pub mod evidence;
pub mod harvest;
pub mod lease;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pages;
pub mod queue;
pub mod ranker;
pub mod rules;
pub mod runner;
pub mod scrape;
pub mod scrape_pool;
pub mod status;
pub mod works;
