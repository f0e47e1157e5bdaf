use std::collections::BTreeMap;

use indicatif::ProgressBar;
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::records::{EnrichedRecord, FailureRecord, PoliticianRecord, Stage};
use crate::regions::RegionTable;
use crate::settings::ConfigError;
use crate::wiki::pageinfo::PageInfoClient;
use crate::wiki::quality::{Credentials, QualityClient};
use crate::wiki::{FetchError, QualityLabel, RevisionId};

/// Title → latest revision id.
pub trait RevisionSource {
    fn fetch_revision_id(&self, title: &str) -> Result<RevisionId, FetchError>;
}

/// Revision id → quality prediction.
pub trait QualitySource {
    fn fetch_quality(
        &self,
        revision_id: RevisionId,
        credentials: &Credentials,
    ) -> Result<QualityLabel, FetchError>;
}

impl RevisionSource for PageInfoClient {
    fn fetch_revision_id(&self, title: &str) -> Result<RevisionId, FetchError> {
        PageInfoClient::fetch_revision_id(self, title)
    }
}

impl QualitySource for QualityClient {
    fn fetch_quality(
        &self,
        revision_id: RevisionId,
        credentials: &Credentials,
    ) -> Result<QualityLabel, FetchError> {
        QualityClient::fetch_quality(self, revision_id, credentials)
    }
}

/// Errors that abort the whole run. Per-record failures never surface here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug)]
pub enum RecordState {
    Pending,
    HasRevision {
        revision_id: RevisionId,
    },
    HasQuality {
        revision_id: RevisionId,
        quality: QualityLabel,
    },
    Enriched(EnrichedRecord),
    Failed {
        stage: Stage,
        error: FetchError,
    },
}

/// Terminal result for one record: the output row, or the stage that failed.
pub type Settled = Result<EnrichedRecord, (Stage, FetchError)>;

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub successes: Vec<EnrichedRecord>,
    pub failures: Vec<FailureRecord>,
}

impl PipelineOutcome {
    pub fn failures_by_stage(&self) -> BTreeMap<Stage, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.stage).or_insert(0) += 1;
        }
        counts
    }

    /// Every input record ended up in exactly one of the two lists.
    pub fn is_complete_for(&self, input_len: usize) -> bool {
        self.successes.len() + self.failures.len() == input_len
    }
}

pub struct EnrichmentPipeline<'a, P, Q> {
    pages: &'a P,
    scores: &'a Q,
    credentials: &'a Credentials,
    regions: &'a RegionTable,
    checkpoint: Option<&'a Checkpoint>,
    run_id: String,
    progress: ProgressBar,
}

impl<'a, P: RevisionSource, Q: QualitySource> EnrichmentPipeline<'a, P, Q> {
    pub fn new(
        pages: &'a P,
        scores: &'a Q,
        credentials: &'a Credentials,
        regions: &'a RegionTable,
    ) -> Self {
        EnrichmentPipeline {
            pages,
            scores,
            credentials,
            regions,
            checkpoint: None,
            run_id: new_run_id(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: &'a Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Process the roster in order. Only configuration and checkpoint errors
    /// stop the run; everything else becomes a `FailureRecord`.
    pub fn run(&self, roster: &[PoliticianRecord]) -> Result<PipelineOutcome, PipelineError> {
        let mut outcome = PipelineOutcome::default();
        if let Some(checkpoint) = self.checkpoint {
            checkpoint.begin_run(&self.run_id)?;
        }
        self.progress.set_length(roster.len() as u64);

        for record in roster {
            match self.process(record)? {
                Ok(enriched) => outcome.successes.push(enriched),
                Err((stage, error)) => {
                    warn!(name = %record.name, %stage, %error, "Record failed");
                    let failure = FailureRecord {
                        politician: record.clone(),
                        stage,
                        error: error.to_string(),
                        raw_response: error.raw_response().cloned(),
                    };
                    if let Some(checkpoint) = self.checkpoint {
                        checkpoint.record_failure(&self.run_id, &failure)?;
                    }
                    outcome.failures.push(failure);
                }
            }
            self.progress.inc(1);
        }

        self.progress.finish_and_clear();
        info!(
            run_id = %self.run_id,
            successes = outcome.successes.len(),
            failures = outcome.failures.len(),
            "Enrichment finished"
        );
        Ok(outcome)
    }

    /// Drive one record from `Pending` to a terminal state.
    pub fn process(&self, record: &PoliticianRecord) -> Result<Settled, PipelineError> {
        let mut state = RecordState::Pending;
        loop {
            state = match self.step(record, state)? {
                RecordState::Enriched(enriched) => return Ok(Ok(enriched)),
                RecordState::Failed { stage, error } => return Ok(Err((stage, error))),
                next => next,
            };
        }
    }

    /// Advance a record by one state.
    pub fn step(
        &self,
        record: &PoliticianRecord,
        state: RecordState,
    ) -> Result<RecordState, PipelineError> {
        let next = match state {
            RecordState::Pending => match self.revision_for(&record.name)? {
                Ok(revision_id) => RecordState::HasRevision { revision_id },
                Err(error) => fail(Stage::PageInfo, error)?,
            },
            RecordState::HasRevision { revision_id } => match self.quality_for(revision_id)? {
                Ok(quality) => RecordState::HasQuality {
                    revision_id,
                    quality,
                },
                Err(error) => fail(Stage::QualityScore, error)?,
            },
            RecordState::HasQuality {
                revision_id,
                quality,
            } => match self.regions.lookup(&record.country) {
                Some(placement) => RecordState::Enriched(EnrichedRecord {
                    country: record.country.clone(),
                    region: placement.region.clone(),
                    population: placement.population,
                    article_title: record.name.clone(),
                    revision_id,
                    article_quality: quality,
                }),
                None => RecordState::Failed {
                    stage: Stage::RegionLookup,
                    error: FetchError::UnknownCountry {
                        country: record.country.clone(),
                    },
                },
            },
            terminal => terminal,
        };
        Ok(next)
    }

    fn revision_for(&self, title: &str) -> Result<Result<RevisionId, FetchError>, PipelineError> {
        if let Some(checkpoint) = self.checkpoint {
            if let Some(revision_id) = checkpoint.revision_for(title)? {
                return Ok(Ok(revision_id));
            }
        }
        let fetched = self.pages.fetch_revision_id(title);
        if let (Some(checkpoint), Ok(revision_id)) = (self.checkpoint, &fetched) {
            checkpoint.save_revision(title, *revision_id)?;
        }
        Ok(fetched)
    }

    fn quality_for(
        &self,
        revision_id: RevisionId,
    ) -> Result<Result<QualityLabel, FetchError>, PipelineError> {
        if let Some(checkpoint) = self.checkpoint {
            if let Some(label) = checkpoint.quality_for(revision_id)? {
                return Ok(Ok(label));
            }
        }
        let fetched = self.scores.fetch_quality(revision_id, self.credentials);
        if let (Some(checkpoint), Ok(label)) = (self.checkpoint, &fetched) {
            checkpoint.save_quality(revision_id, label)?;
        }
        Ok(fetched)
    }
}

/// Config errors abort; anything else marks the record failed at `stage`.
fn fail(stage: Stage, error: FetchError) -> Result<RecordState, PipelineError> {
    match error {
        FetchError::Config(err) => Err(PipelineError::Config(err)),
        error => Ok(RecordState::Failed { stage, error }),
    }
}

pub fn new_run_id() -> String {
    format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Contact;
    use crate::tables::RecordWriter;
    use serde_json::json;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Deterministic page-info stand-in keyed by title.
    #[derive(Default)]
    struct StubPages {
        revisions: HashMap<String, RevisionId>,
        calls: Cell<usize>,
    }

    impl StubPages {
        fn with(pairs: &[(&str, RevisionId)]) -> Self {
            StubPages {
                revisions: pairs.iter().map(|(t, r)| (t.to_string(), *r)).collect(),
                calls: Cell::new(0),
            }
        }
    }

    impl RevisionSource for StubPages {
        fn fetch_revision_id(&self, title: &str) -> Result<RevisionId, FetchError> {
            self.calls.set(self.calls.get() + 1);
            if title.is_empty() {
                return Err(ConfigError::EmptyTitle.into());
            }
            if title == "Offline" {
                return Err(FetchError::Transport("connection reset".into()));
            }
            self.revisions
                .get(title)
                .copied()
                .ok_or_else(|| FetchError::NoRevision {
                    title: title.to_string(),
                    raw: Some(json!({"ns": 0, "title": title, "missing": ""})),
                })
        }
    }

    #[derive(Default)]
    struct StubScores {
        labels: HashMap<RevisionId, &'static str>,
        calls: Cell<usize>,
    }

    impl StubScores {
        fn with(pairs: &[(RevisionId, &'static str)]) -> Self {
            StubScores {
                labels: pairs.iter().copied().collect(),
                calls: Cell::new(0),
            }
        }
    }

    impl QualitySource for StubScores {
        fn fetch_quality(
            &self,
            revision_id: RevisionId,
            _credentials: &Credentials,
        ) -> Result<QualityLabel, FetchError> {
            self.calls.set(self.calls.get() + 1);
            self.labels
                .get(&revision_id)
                .map(|l| QualityLabel::new(*l))
                .ok_or_else(|| FetchError::NoScore {
                    revision_id,
                    model: "articlequality".into(),
                    raw: Some(json!({"enwiki": {"scores": {}}})),
                })
        }
    }

    fn credentials() -> Credentials {
        Credentials::new(Contact::parse("ada@uni.edu").unwrap(), "token").unwrap()
    }

    fn regions() -> RegionTable {
        RegionTable::parse([
            ("WORLD", 8009.0),
            ("AFRICA", 1453.0),
            ("Algeria", 46.8),
            ("Nigeria", 223.8),
        ])
        .unwrap()
    }

    fn politician(name: &str, country: &str) -> PoliticianRecord {
        PoliticianRecord {
            name: name.into(),
            url: format!("https://en.wikipedia.org/wiki/{}", name),
            country: country.into(),
        }
    }

    #[test]
    fn single_record_end_to_end() {
        let pages = StubPages::with(&[("X", 100)]);
        let scores = StubScores::with(&[(100, "B")]);
        let creds = credentials();
        let table = regions();
        let pipeline = EnrichmentPipeline::new(&pages, &scores, &creds, &table);

        let outcome = pipeline.run(&[politician("X", "Algeria")]).unwrap();
        assert!(outcome.failures.is_empty());
        assert_eq!(
            outcome.successes,
            vec![EnrichedRecord {
                country: "Algeria".into(),
                region: "AFRICA".into(),
                population: 46.8,
                article_title: "X".into(),
                revision_id: 100,
                article_quality: QualityLabel::new("B"),
            }]
        );
    }

    #[test]
    fn failures_are_isolated_and_ordered() {
        let pages = StubPages::with(&[("A", 1), ("B", 2), ("C", 3), ("D", 4)]);
        let scores = StubScores::with(&[(1, "Stub"), (3, "GA"), (4, "FA")]);
        let creds = credentials();
        let table = regions();
        let pipeline = EnrichmentPipeline::new(&pages, &scores, &creds, &table);

        let roster = vec![
            politician("D", "Nigeria"),
            politician("Missing", "Algeria"),
            politician("A", "Algeria"),
            politician("B", "Algeria"),
            politician("Offline", "Algeria"),
            politician("C", "Atlantis"),
        ];
        let outcome = pipeline.run(&roster).unwrap();

        assert!(outcome.is_complete_for(roster.len()));
        let titles: Vec<&str> = outcome
            .successes
            .iter()
            .map(|r| r.article_title.as_str())
            .collect();
        assert_eq!(titles, ["D", "A"]);

        let failed: Vec<(&str, Stage)> = outcome
            .failures
            .iter()
            .map(|f| (f.politician.name.as_str(), f.stage))
            .collect();
        assert_eq!(
            failed,
            [
                ("Missing", Stage::PageInfo),
                ("B", Stage::QualityScore),
                ("Offline", Stage::PageInfo),
                ("C", Stage::RegionLookup),
            ]
        );

        assert_eq!(outcome.failures[0].raw_response.as_ref().unwrap()["missing"], "");
        assert!(outcome.failures[2].raw_response.is_none());
        assert!(outcome.failures[3].error.contains("Atlantis"));

        let by_stage = outcome.failures_by_stage();
        assert_eq!(by_stage[&Stage::PageInfo], 2);
        assert_eq!(by_stage[&Stage::QualityScore], 1);
        assert_eq!(by_stage[&Stage::RegionLookup], 1);
    }

    #[test]
    fn failed_revision_skips_quality_call() {
        let pages = StubPages::default();
        let scores = StubScores::default();
        let creds = credentials();
        let table = regions();
        let pipeline = EnrichmentPipeline::new(&pages, &scores, &creds, &table);

        let outcome = pipeline.run(&[politician("Nobody", "Algeria")]).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(pages.calls.get(), 1);
        assert_eq!(scores.calls.get(), 0);
    }

    #[test]
    fn config_error_aborts_run() {
        let pages = StubPages::default();
        let scores = StubScores::default();
        let creds = credentials();
        let table = regions();
        let pipeline = EnrichmentPipeline::new(&pages, &scores, &creds, &table);

        let result = pipeline.run(&[politician("", "Algeria")]);
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::EmptyTitle))
        ));
    }

    #[test]
    fn step_walks_the_states() {
        let pages = StubPages::with(&[("X", 7)]);
        let scores = StubScores::with(&[(7, "C")]);
        let creds = credentials();
        let table = regions();
        let pipeline = EnrichmentPipeline::new(&pages, &scores, &creds, &table);
        let record = politician("X", "Nigeria");

        let state = pipeline.step(&record, RecordState::Pending).unwrap();
        assert!(matches!(state, RecordState::HasRevision { revision_id: 7 }));
        let state = pipeline.step(&record, state).unwrap();
        assert!(matches!(state, RecordState::HasQuality { revision_id: 7, .. }));
        let state = pipeline.step(&record, state).unwrap();
        assert!(matches!(state, RecordState::Enriched(ref r) if r.region == "AFRICA"));
        // terminal states stay put
        let state = pipeline.step(&record, state).unwrap();
        assert!(matches!(state, RecordState::Enriched(_)));
    }

    #[test]
    fn checkpoint_skips_finished_calls_on_rerun() {
        let checkpoint = Checkpoint::in_memory().unwrap();
        let creds = credentials();
        let table = regions();
        let roster = vec![politician("A", "Algeria"), politician("Gone", "Algeria")];

        let pages = StubPages::with(&[("A", 1)]);
        let scores = StubScores::with(&[(1, "B")]);
        let first = EnrichmentPipeline::new(&pages, &scores, &creds, &table)
            .with_checkpoint(&checkpoint)
            .with_run_id("run-1")
            .run(&roster)
            .unwrap();
        assert_eq!(first.successes.len(), 1);
        assert_eq!((pages.calls.get(), scores.calls.get()), (2, 1));

        let pages = StubPages::with(&[("A", 1)]);
        let scores = StubScores::with(&[(1, "B")]);
        let second = EnrichmentPipeline::new(&pages, &scores, &creds, &table)
            .with_checkpoint(&checkpoint)
            .with_run_id("run-2")
            .run(&roster)
            .unwrap();
        assert_eq!(second.successes, first.successes);
        // only the failed title is asked again
        assert_eq!((pages.calls.get(), scores.calls.get()), (1, 0));

        let stats = checkpoint.stats().unwrap();
        assert_eq!(stats.latest_run.as_deref(), Some("run-2"));
        assert_eq!(stats.failures_by_stage, vec![("pageinfo".to_string(), 1)]);
        // a run without failures still becomes the latest one
        EnrichmentPipeline::new(&pages, &scores, &creds, &table)
            .with_checkpoint(&checkpoint)
            .with_run_id("run-3")
            .run(&roster[..1])
            .unwrap();
        let stats = checkpoint.stats().unwrap();
        assert_eq!(stats.latest_run.as_deref(), Some("run-3"));
        assert!(stats.failures_by_stage.is_empty());
    }

    #[test]
    fn reruns_write_identical_bytes() {
        let creds = credentials();
        let table = regions();
        let roster = vec![
            politician("A", "Algeria"),
            politician("B", "Nigeria"),
            politician("Gone", "Algeria"),
        ];

        let render = || {
            let pages = StubPages::with(&[("A", 1), ("B", 2)]);
            let scores = StubScores::with(&[(1, "Start"), (2, "GA")]);
            let outcome = EnrichmentPipeline::new(&pages, &scores, &creds, &table)
                .run(&roster)
                .unwrap();
            RecordWriter::from_writer(Vec::new())
                .write(outcome.successes)
                .unwrap()
        };

        let first = render();
        assert_eq!(first, render());
        assert_eq!(
            String::from_utf8(first).unwrap(),
            "country,region,population,article_title,revision_id,article_quality\n\
             Algeria,AFRICA,46.8,A,1,Start\n\
             Nigeria,AFRICA,223.8,B,2,GA\n"
        );
    }

    #[test]
    fn run_ids_are_prefixed() {
        assert!(new_run_id().starts_with("run-"));
    }
}
