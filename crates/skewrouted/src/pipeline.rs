//! Record pipeline
//!
//! Reads one record per line, feeds its key to the detector instances,
//! routes it through the planner's partition function and writes
//! `key<TAB>partition` to the sink. Every `metric_window_size` records the
//! detection epoch closes and its hot keys are reported to the planner.
//! Plan draining happens elsewhere (the driver task); records keep flowing
//! while a migration is in progress.

use crate::cli::{PipelineConfig, STDIO};
use crate::detector::DetectorGroup;
use skewroute::{RebalancePlanner, RouteError};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records routed
    pub records: u64,
    /// Blank lines or lines without the key field
    pub skipped_lines: u64,
    /// Detection epochs closed
    pub epochs: u64,
    /// Epochs whose reports completed a planning round
    pub rounds_planned: u64,
    /// Epochs not reported because the planner was busy
    pub epochs_skipped: u64,
    /// Records routed to each partition
    pub partition_counts: Vec<u64>,
}

/// Detection, reporting and routing over a line-oriented record stream
pub struct Pipeline {
    planner: Arc<RebalancePlanner<String>>,
    detectors: DetectorGroup<String>,
    window: usize,
    key_field: usize,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, planner: Arc<RebalancePlanner<String>>) -> Self {
        let parallelism = planner.config().parallelism;
        Self {
            detectors: DetectorGroup::counting(parallelism, config.hot_key_threshold),
            window: config.metric_window_size,
            key_field: config.key_field,
            planner,
        }
    }

    /// Process the input until it ends or `shutdown` is raised
    pub fn run<R, W>(&mut self, input: R, output: W, shutdown: &AtomicBool) -> anyhow::Result<PipelineStats>
    where
        R: BufRead,
        W: Write,
    {
        let mut output = BufWriter::new(output);
        let mut stats = PipelineStats {
            partition_counts: vec![0; self.detectors.len()],
            ..Default::default()
        };
        let mut in_epoch = 0usize;

        for line in input.lines() {
            if shutdown.load(Ordering::Relaxed) {
                info!(records = stats.records, "Pipeline interrupted");
                break;
            }
            let line = line?;
            let Some(key) = line.split_whitespace().nth(self.key_field) else {
                stats.skipped_lines += 1;
                continue;
            };
            let key = key.to_string();

            self.detectors.observe(&key);
            let partition = self.planner.partition(&key);
            writeln!(output, "{}\t{}", key, partition)?;

            stats.records += 1;
            if let Some(count) = stats.partition_counts.get_mut(partition as usize) {
                *count += 1;
            }

            in_epoch += 1;
            if in_epoch == self.window {
                self.close_epoch(&mut stats)?;
                in_epoch = 0;
            }
        }

        if in_epoch > 0 {
            self.close_epoch(&mut stats)?;
        }
        output.flush()?;

        info!(
            records = stats.records,
            epochs = stats.epochs,
            rounds = stats.rounds_planned,
            skipped_epochs = stats.epochs_skipped,
            "Pipeline finished"
        );
        Ok(stats)
    }

    /// Report the closed epoch's hot keys; skipped while the planner is busy
    fn close_epoch(&mut self, stats: &mut PipelineStats) -> anyhow::Result<()> {
        let (reports, merged) = self.detectors.end_epoch();
        stats.epochs += 1;

        if !self.planner.accepts_reports() {
            debug!(epoch = stats.epochs, state = %self.planner.state(), "Planner busy, epoch not reported");
            stats.epochs_skipped += 1;
            return Ok(());
        }

        if let Err(e) = self.planner.set_hot_key_set(merged) {
            return Self::skip_or_fail(e, stats);
        }

        for (instance, report) in reports.into_iter().enumerate() {
            match self.planner.report(instance, report.into_keys()) {
                Ok(Some(summary)) => {
                    stats.rounds_planned += 1;
                    info!(
                        epoch = summary.epoch,
                        hot_keys = summary.outcome.assignment.len(),
                        steps = summary.outcome.steps.len(),
                        batches = summary.batches,
                        "Epoch planned"
                    );
                }
                Ok(None) => {}
                Err(e) => return Self::skip_or_fail(e, stats),
            }
        }
        Ok(())
    }

    fn skip_or_fail(e: RouteError, stats: &mut PipelineStats) -> anyhow::Result<()> {
        if e.is_retriable() {
            warn!(error = %e, "Epoch report rejected");
            stats.epochs_skipped += 1;
            Ok(())
        } else {
            Err(e.into())
        }
    }
}

/// Open the input source; "-" is stdin
pub fn open_input(source: &str) -> io::Result<Box<dyn BufRead + Send>> {
    if source == STDIO {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(source)?)))
    }
}

/// Open the output sink; "-" is stdout
pub fn open_output(sink: &str) -> io::Result<Box<dyn Write + Send>> {
    if sink == STDIO {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(File::create(sink)?))
    }
}
