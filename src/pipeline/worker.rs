//! Processing of a single unit. Runs on the blocking pool.
//!
//! The unit's time budget starts when the job starts running. Parsing and
//! extraction poll the deadline and stop on their own; a load that overruns
//! is reported once it returns.
use std::time::{Duration, Instant};
use tracing::debug;

use super::UnitFailure;
use crate::aggregate::AggregateTable;
use crate::extractor::{ExtractionError, FactExtractor};
use crate::loader::{SourceLoader, SourceUnit, UnitDescriptor};
use crate::parser::{ParseFailure, ParserAdapter};

/// Facts of one unit, already folded in extraction order.
#[derive(Debug, Default)]
pub struct UnitFacts {
    pub table: AggregateTable,
    pub facts: u64,
}

#[derive(Debug)]
pub struct UnitResult {
    /// Known once the content was read (or recorded by the corpus).
    pub content_hash: Option<String>,
    pub outcome: Result<UnitFacts, UnitFailure>,
}

/// Load, parse and extract one unit within `limit`. The content and the
/// tree are dropped before returning; only the folded table leaves this
/// function.
pub fn process_unit(
    loader: &dyn SourceLoader,
    parser: &ParserAdapter,
    extractor: &FactExtractor,
    corpus_id: &str,
    descriptor: &UnitDescriptor,
    limit: Duration,
) -> UnitResult {
    let deadline = Instant::now() + limit;
    let timeout = UnitFailure::Timeout {
        limit_ms: limit.as_millis() as u64,
    };
    let content = match loader.load(descriptor) {
        Ok(content) => content,
        Err(e) => {
            return UnitResult {
                content_hash: descriptor.content_hash.clone(),
                outcome: Err(e.into()),
            };
        }
    };
    let unit = SourceUnit::new(corpus_id, descriptor, &content);
    if Instant::now() >= deadline {
        return UnitResult {
            content_hash: Some(unit.content_hash),
            outcome: Err(timeout),
        };
    }
    let outcome = match parse_and_extract(parser, extractor, &unit, &content, deadline) {
        Err(
            UnitFailure::Parse(ParseFailure::DeadlineExceeded)
            | UnitFailure::Extraction(ExtractionError::DeadlineExceeded),
        ) => Err(timeout),
        other => other,
    };
    if let Ok(facts) = &outcome {
        debug!("{}: {} facts, {} bytes", unit.id(), facts.facts, unit.byte_size);
    }
    UnitResult {
        content_hash: Some(unit.content_hash),
        outcome,
    }
}

fn parse_and_extract(
    parser: &ParserAdapter,
    extractor: &FactExtractor,
    unit: &SourceUnit,
    content: &[u8],
    deadline: Instant,
) -> Result<UnitFacts, UnitFailure> {
    let tree = parser.parse_until(content, unit.language, deadline)?;
    if tree.is_partial() {
        debug!(
            "{}: parsed through {} recovered error spans",
            unit.id(),
            tree.error_spans().len()
        );
    }
    let mut folded = UnitFacts::default();
    for fact in extractor.extract_until(&tree, unit, deadline) {
        folded.table.apply(&fact?);
        folded.facts += 1;
    }
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{DetectorRegistry, ExtractOptions, FactKind};
    use crate::loader::testing::VecLoader;
    use crate::loader::{Cursor, LoadError, Location};
    use crate::parser::{ParseFailure, ParseOptions};
    use std::path::PathBuf;

    fn run(loader: &VecLoader, descriptor: &UnitDescriptor) -> UnitResult {
        let parser = ParserAdapter::new(ParseOptions::default());
        let extractor = FactExtractor::new(ExtractOptions::default(), DetectorRegistry::builtin().unwrap()).unwrap();
        process_unit(loader, &parser, &extractor, "mem", descriptor, Duration::from_secs(30))
    }

    #[test]
    fn test_outcomes_per_stage() {
        let loader = VecLoader::python(vec![
            ("ok.py", "import os\nos.getcwd()\n"),
            ("bad.py", "x = \"abc\n"),
        ]);
        let units: Vec<UnitDescriptor> = loader.units(Cursor::START).unwrap().map(|u| u.unwrap()).collect();

        let ok = run(&loader, &units[0]);
        let facts = ok.outcome.unwrap();
        assert_eq!(facts.table.count(&FactKind::Call, "os.getcwd"), 1);
        assert!(ok.content_hash.is_some());

        let bad = run(&loader, &units[1]);
        assert!(matches!(
            bad.outcome,
            Err(UnitFailure::Parse(ParseFailure::Syntax { line: 1, .. }))
        ));
        assert!(bad.content_hash.is_some());

        let mut missing = units[0].clone();
        missing.location = Location::File(PathBuf::from("/no/such/file.py"));
        let gone = run(&loader, &missing);
        assert!(matches!(gone.outcome, Err(UnitFailure::Load(LoadError::Io { .. }))));
        assert!(gone.content_hash.is_none());
    }

    #[test]
    fn test_overrunning_unit_stops_with_timeout() {
        let big: String = (0..50_000).map(|i| format!("v{i} = f{i}(x.y, [z])\n")).collect();
        let loader = VecLoader::python(vec![("big.py", big.as_str())]);
        let units: Vec<UnitDescriptor> = loader.units(Cursor::START).unwrap().map(|u| u.unwrap()).collect();
        let parser = ParserAdapter::new(ParseOptions::default());
        let extractor = FactExtractor::new(ExtractOptions::default(), DetectorRegistry::builtin().unwrap()).unwrap();

        let result = process_unit(&loader, &parser, &extractor, "mem", &units[0], Duration::ZERO);
        assert_eq!(result.outcome.err(), Some(UnitFailure::Timeout { limit_ms: 0 }));
        assert!(result.content_hash.is_some());

        let full = process_unit(&loader, &parser, &extractor, "mem", &units[0], Duration::from_secs(600));
        assert!(full.outcome.unwrap().facts > 50_000);
    }
}
