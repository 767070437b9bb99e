use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::stats::RoundRecord;

// Column names are load-bearing: the offline chart tooling looks them up
// literally, spaces and all.
const ROUND_HEADER: &str = "Round,TotalPackets,Duration(s),Throughput(p/s),Errors";
const SESSION_HEADER: &str = "Rounds,TotalPackets,Duration(s),Throughput(p/s),Errors";

/// End-of-session totals across every sealed round.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSummary {
    pub rounds: u32,
    pub packets: u64,
    pub duration_secs: f64,
    pub errors: u64,
}

impl SessionSummary {
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.packets as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// CSV sink for sealed rounds plus the one-line session summary.
pub struct SessionReport<W: Write> {
    rounds: W,
    session: W,
    summary: SessionSummary,
}

impl SessionReport<Box<dyn Write>> {
    /// Creates `<prefix>_rounds.csv` and `<prefix>_session.csv`.
    pub fn create(prefix: &str) -> Result<Self> {
        let rounds_path = PathBuf::from(format!("{}_rounds.csv", prefix));
        let session_path = PathBuf::from(format!("{}_session.csv", prefix));
        let rounds: Box<dyn Write> = Box::new(BufWriter::new(
            File::create(&rounds_path)
                .with_context(|| format!("creating {}", rounds_path.display()))?,
        ));
        let session: Box<dyn Write> = Box::new(BufWriter::new(
            File::create(&session_path)
                .with_context(|| format!("creating {}", session_path.display()))?,
        ));
        Self::over(rounds, session)
    }
}

impl<W: Write> SessionReport<W> {
    pub fn over(mut rounds: W, session: W) -> Result<Self> {
        writeln!(rounds, "{}", ROUND_HEADER).context("writing round log header")?;
        Ok(Self {
            rounds,
            session,
            summary: SessionSummary::default(),
        })
    }

    /// Appends one sealed round and folds it into the running totals. Rows
    /// are flushed as they land so a crash loses nothing.
    pub fn record_round(&mut self, rec: &RoundRecord) -> Result<()> {
        writeln!(
            self.rounds,
            "{},{},{:.3},{:.3},{}",
            rec.round, rec.packets, rec.duration_secs, rec.throughput, rec.errors
        )
        .context("writing round record")?;
        self.rounds.flush().context("flushing round log")?;
        self.summary.rounds += 1;
        self.summary.packets += rec.packets;
        self.summary.duration_secs += rec.duration_secs;
        self.summary.errors += rec.errors;
        Ok(())
    }

    /// Writes the summary log and hands the totals back for the console.
    pub fn finish(mut self) -> Result<SessionSummary> {
        writeln!(self.session, "{}", SESSION_HEADER).context("writing session header")?;
        writeln!(
            self.session,
            "{},{},{:.3},{:.3},{}",
            self.summary.rounds,
            self.summary.packets,
            self.summary.duration_secs,
            self.summary.throughput(),
            self.summary.errors
        )
        .context("writing session summary")?;
        self.session.flush().context("flushing session log")?;
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(round: u32, packets: u64, duration_secs: f64, errors: u64) -> RoundRecord {
        let throughput = if duration_secs > 0.0 {
            packets as f64 / duration_secs
        } else {
            0.0
        };
        RoundRecord {
            round,
            packets,
            duration_secs,
            throughput,
            errors,
        }
    }

    #[test]
    fn round_log_layout_is_exact() {
        let mut rounds = Vec::new();
        let mut session = Vec::new();
        {
            let mut report = SessionReport::over(&mut rounds, &mut session).unwrap();
            report.record_round(&rec(1, 150, 3.0, 0)).unwrap();
            report.record_round(&rec(2, 75, 3.0, 2)).unwrap();
            report.finish().unwrap();
        }
        let text = String::from_utf8(rounds).unwrap();
        assert_eq!(
            text,
            "Round,TotalPackets,Duration(s),Throughput(p/s),Errors\n\
             1,150,3.000,50.000,0\n\
             2,75,3.000,25.000,2\n"
        );
    }

    #[test]
    fn session_log_totals_all_rounds() {
        let mut rounds = Vec::new();
        let mut session = Vec::new();
        let summary = {
            let mut report = SessionReport::over(&mut rounds, &mut session).unwrap();
            report.record_round(&rec(1, 150, 3.0, 0)).unwrap();
            report.record_round(&rec(2, 75, 3.0, 2)).unwrap();
            report.finish().unwrap()
        };
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.packets, 225);
        assert_eq!(summary.errors, 2);
        let text = String::from_utf8(session).unwrap();
        assert_eq!(
            text,
            "Rounds,TotalPackets,Duration(s),Throughput(p/s),Errors\n\
             2,225,6.000,37.500,2\n"
        );
    }

    #[test]
    fn empty_session_still_writes_headers() {
        let mut rounds = Vec::new();
        let mut session = Vec::new();
        let summary = {
            let report = SessionReport::over(&mut rounds, &mut session).unwrap();
            report.finish().unwrap()
        };
        assert_eq!(summary.rounds, 0);
        assert_eq!(summary.throughput(), 0.0);
        let text = String::from_utf8(session).unwrap();
        assert_eq!(
            text,
            "Rounds,TotalPackets,Duration(s),Throughput(p/s),Errors\n\
             0,0,0.000,0.000,0\n"
        );
    }
}
