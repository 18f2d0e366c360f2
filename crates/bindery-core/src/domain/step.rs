//! Step - which executor handles a job.
//!
//! 既知の step は enum で固定し、DB に未知の名前が入っていた場合は
//! `Step::Other` として読み込みます（プロセスではなくジョブを失敗させるため）。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Book pipeline step vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    /// Pull canonical text out of the source document.
    ExtractText,
    /// Locate, crop and export figures.
    ExtractFigures,
    /// Language-model rewrite of a chapter or section.
    Rewrite,
    /// Merge rewritten fragments and figures into one canonical document.
    Assemble,
    RenderHtml,
    RenderPdf,
    /// Layout checks on the rendered output.
    Validate,
    /// Bundle the final deliverables.
    Package,
    /// A step name outside the known vocabulary.
    Other(String),
}

impl Step {
    pub const KNOWN: [Step; 8] = [
        Step::ExtractText,
        Step::ExtractFigures,
        Step::Rewrite,
        Step::Assemble,
        Step::RenderHtml,
        Step::RenderPdf,
        Step::Validate,
        Step::Package,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Step::ExtractText => "extract_text",
            Step::ExtractFigures => "extract_figures",
            Step::Rewrite => "rewrite",
            Step::Assemble => "assemble",
            Step::RenderHtml => "render_html",
            Step::RenderPdf => "render_pdf",
            Step::Validate => "validate",
            Step::Package => "package",
            Step::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Step::Other(_))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Step::KNOWN
            .into_iter()
            .find(|step| step.as_str() == s)
            .unwrap_or_else(|| Step::Other(s.to_string())))
    }
}

impl From<&str> for Step {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(step) => step,
            Err(never) => match never {},
        }
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Step::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_steps_parse_to_their_variant() {
        for step in Step::KNOWN {
            assert_eq!(Step::from(step.as_str()), step);
            assert!(step.is_known());
        }
    }

    #[test]
    fn unknown_names_fall_back_to_other() {
        let step = Step::from("typeset_indesign");
        assert_eq!(step, Step::Other("typeset_indesign".to_string()));
        assert!(!step.is_known());
        assert_eq!(step.to_string(), "typeset_indesign");
    }

    #[test]
    fn serializes_as_plain_name() {
        let json = serde_json::to_string(&Step::RenderPdf).unwrap();
        assert_eq!(json, "\"render_pdf\"");
        let back: Step = serde_json::from_str("\"rewrite\"").unwrap();
        assert_eq!(back, Step::Rewrite);
    }
}
