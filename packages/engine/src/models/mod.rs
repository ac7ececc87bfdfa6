//! Database models for tasks, outputs, and deliveries.
//!
//! All identifiers are v4 UUIDs and all timestamps are UTC. Enumerated
//! columns are Postgres enum types whose wire form is the short snake_case
//! string. The task is the sole owner of its children: outputs and
//! deliveries hold a `task_id` and nothing points back the other way.

pub mod delivery;
pub mod output;
pub mod task;

pub use delivery::{Delivery, DeliveryChannel, DeliveryStatus};
pub use output::{object_key, CaptureOutput};
pub use task::{CaptureTask, TaskStatus};

use serde::{Deserialize, Serialize};

/// Bit flags for the formats a task requests.
pub const FORMAT_PDF: i32 = 1;
pub const FORMAT_HTML: i32 = 2;
pub const FORMAT_PNG: i32 = 4;

/// One artifact format a capture can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "capture_format", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Pdf,
    Html,
    Screenshot,
}

impl OutputFormat {
    /// All formats, in the order captures produce them.
    pub const ALL: [OutputFormat; 3] =
        [OutputFormat::Pdf, OutputFormat::Html, OutputFormat::Screenshot];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Html => "html",
            OutputFormat::Screenshot => "screenshot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(OutputFormat::Pdf),
            "html" => Some(OutputFormat::Html),
            "screenshot" => Some(OutputFormat::Screenshot),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Html => "text/html",
            OutputFormat::Screenshot => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Html => "html",
            OutputFormat::Screenshot => "png",
        }
    }

    /// The task bit-set flag for this format.
    pub fn flag(&self) -> i32 {
        match self {
            OutputFormat::Pdf => FORMAT_PDF,
            OutputFormat::Html => FORMAT_HTML,
            OutputFormat::Screenshot => FORMAT_PNG,
        }
    }

    /// Decode a task's format bit-set into concrete formats.
    pub fn from_bits(bits: i32) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|f| bits & f.flag() != 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_mapping_is_exact() {
        assert_eq!(OutputFormat::Pdf.content_type(), "application/pdf");
        assert_eq!(OutputFormat::Pdf.extension(), "pdf");
        assert_eq!(OutputFormat::Html.content_type(), "text/html");
        assert_eq!(OutputFormat::Html.extension(), "html");
        assert_eq!(OutputFormat::Screenshot.content_type(), "image/png");
        assert_eq!(OutputFormat::Screenshot.extension(), "png");
    }

    #[test]
    fn bit_set_roundtrip() {
        assert_eq!(
            OutputFormat::from_bits(FORMAT_PDF | FORMAT_HTML | FORMAT_PNG),
            vec![OutputFormat::Pdf, OutputFormat::Html, OutputFormat::Screenshot]
        );
        assert_eq!(OutputFormat::from_bits(FORMAT_HTML), vec![OutputFormat::Html]);
        assert_eq!(OutputFormat::from_bits(0), vec![]);
        // Unknown high bits are ignored.
        assert_eq!(OutputFormat::from_bits(8), vec![]);
    }

    #[test]
    fn format_names_roundtrip() {
        for format in OutputFormat::ALL {
            assert_eq!(OutputFormat::from_str(format.as_str()), Some(format));
        }
        assert_eq!(OutputFormat::from_str("png"), None);
        assert_eq!(OutputFormat::from_str(""), None);
    }
}
