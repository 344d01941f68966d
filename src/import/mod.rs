//! Card import: delimited-file parsing, collision detection and the three
//! merge strategies.

pub mod execute;
pub mod report;
mod rows;

pub use execute::{detect_collisions, import_cards, ImportReport, ImportStrategy};
pub use report::write_import_report;
pub use rows::{parse_csv, ParsedRows, RowError, SkippedRow};
