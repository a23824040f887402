//! End-to-end scenarios run against the in-memory nameserver.
//!
//! ```text
//! ┌──────────────┐   Manifest::load   ┌───────────────┐
//! │ InMemory     │ ─────────────────▶ │ Migrator /    │
//! │ Nameserver   │                    │ Transformation│
//! │ (seeded)     │ ◀───────────────── │ + bind        │
//! └──────────────┘  scheduler.run()   └───────────────┘
//!        │
//!        ▼
//!  journal, copies, busy peaks, reloaded manifest
//! ```

pub(crate) mod utils;
