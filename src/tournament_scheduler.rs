//! Runs every battle of a tournament on a pool of worker threads.
//!
//! Workers pull battles from a shared queue and play each one to its end. Programs are run
//! through a [`BudgetedSandbox`], so no more programs execute at once than the
//! [`ResourcePool`] allows, whatever the number of workers. Reports come back through an
//! `mpsc` channel in completion order.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use tracing::{error, info, instrument, trace};

use crate::{
    battle::{Battle, BattleId, BattleReport, BattleStatus},
    cancellation::Cancellation,
    configuration::Configuration,
    constraints::{Constraints, MatchLimits},
    match_executor::MatchExecutor,
    problem::Problem,
    progress::ProgressEvent,
    protocol::ProtocolConfig,
    resource_pool::ResourcePool,
    sandbox::{BudgetedSandbox, Sandbox},
};

/// Spreads battle seeds apart so that neighbouring battles and neighbouring base seeds never
/// share a seed stream.
fn battle_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

pub(crate) struct TournamentScheduler<'a> {
    problem: &'a dyn Problem,
    protocol: &'a ProtocolConfig,
    sandbox: BudgetedSandbox<Arc<dyn Sandbox>>,
    pool: Arc<ResourcePool>,
    limits: MatchLimits,
    battle_deadline: Option<Duration>,
    config: Configuration,
    pending: Mutex<VecDeque<(usize, BattleId)>>,
    running: Mutex<Vec<BattleId>>,
    workers: usize,
}

impl<'a> TournamentScheduler<'a> {
    pub(crate) fn new(
        problem: &'a dyn Problem,
        protocol: &'a ProtocolConfig,
        sandbox: Arc<dyn Sandbox>,
        constraints: &Constraints,
        config: Configuration,
        battles: Vec<BattleId>,
    ) -> Self {
        let pool = Arc::new(ResourcePool::new(constraints));
        let workers = battles.len().min(constraints.max_parallel_runs()).max(1);
        TournamentScheduler {
            problem,
            protocol,
            sandbox: BudgetedSandbox::new(sandbox, pool.clone()),
            pool,
            limits: constraints.limits(),
            battle_deadline: constraints.battle_deadline(),
            config,
            pending: Mutex::new(battles.into_iter().enumerate().collect()),
            running: Mutex::new(vec![]),
            workers,
        }
    }

    /// Plays every queued battle and returns exactly one report per battle.
    ///
    /// Once `root` fires, battles still queued are reported as cancelled without being played.
    #[instrument(skip_all)]
    pub(crate) fn run(
        &self,
        root: &Cancellation,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> Vec<BattleReport> {
        let total = self.pending.lock().unwrap_or_else(PoisonError::into_inner).len();
        info!(total, workers = self.workers, "scheduling battles");

        let (tx_report, rx_report) = mpsc::channel();
        let reports = thread::scope(|scope| {
            for worker in 0..self.workers {
                let tx_report = tx_report.clone();
                let progress = progress.cloned();
                scope.spawn(move || self.work(worker, root, tx_report, progress));
            }
            // not finished <=> a worker still holds a sender
            drop(tx_report);

            let mut reports = Vec::with_capacity(total);
            for report in rx_report {
                if self.config.verbose {
                    print_battle_report(&report);
                }
                reports.push(report);
            }
            reports
        });

        info!(
            reported = reports.len(),
            peak_parallel_runs = self.pool.peak(),
            "all battles reported"
        );
        reports
    }

    fn next_battle(&self) -> Option<(usize, BattleId)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    #[instrument(skip_all, fields(worker = worker))]
    fn work(
        &self,
        worker: usize,
        root: &Cancellation,
        tx_report: Sender<BattleReport>,
        progress: Option<Sender<ProgressEvent>>,
    ) {
        let executor = MatchExecutor::new(self.problem, &self.sandbox, self.limits)
            .with_retain_payloads(self.config.retain_payloads);

        while let Some((index, id)) = self.next_battle() {
            let report = if root.is_cancelled() {
                trace!(battle = %id, "skipped, tournament cancelled");
                let report = BattleReport::not_started(id);
                if let Some(tx) = &progress {
                    let _ = tx.send(ProgressEvent::BattleFinished {
                        battle: report.id.clone(),
                        status: report.status.clone(),
                        score: None,
                    });
                }
                report
            } else {
                self.add_running(&id);
                let report = self.play(index, id.clone(), &executor, root, progress.as_ref());
                self.remove_running(&id);
                report
            };

            if tx_report.send(report).is_err() {
                error!(worker, "report channel closed");
                break;
            }
        }
    }

    fn play(
        &self,
        index: usize,
        id: BattleId,
        executor: &MatchExecutor<'_>,
        root: &Cancellation,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> BattleReport {
        let cancellation = root.child(self.battle_deadline);
        let battle = Battle::new(id.clone(), battle_seed(self.config.seed, index));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            battle.run(self.protocol, executor, &cancellation, progress)
        }));
        // stop whatever the battle may have left behind
        cancellation.cancel();

        result.unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(battle = %id, "battle panicked: {message}");
            let status = BattleStatus::Failed {
                error: format!("battle panicked: {message}"),
            };
            if let Some(tx) = progress {
                let _ = tx.send(ProgressEvent::BattleFinished {
                    battle: id.clone(),
                    status: status.clone(),
                    score: None,
                });
            }
            BattleReport {
                id,
                status,
                history: vec![],
                score: None,
            }
        })
    }

    fn add_running(&self, id: &BattleId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.push(id.clone());
        if self.config.verbose {
            print_running_battles(&running, self.pool.running());
        }
    }

    fn remove_running(&self, id: &BattleId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = running.iter().position(|b| b == id) {
            running.remove(pos);
        }
    }
}

fn print_battle_report(report: &BattleReport) {
    let score = report
        .score
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let rounds = report.history.len();
    match &report.status {
        // clear line, green battle, results, start of line
        BattleStatus::Concluded => println!(
            "\x1b[2K\x1b[32m{}: \x1b[39m{score} ({rounds} rounds)\x1b[0G",
            report.id
        ),
        // clear line, yellow battle, status, start of line
        BattleStatus::Cancelled { .. } => println!(
            "\x1b[2K\x1b[33m{}: \x1b[39m{} {score} ({rounds} rounds)\x1b[0G",
            report.id, report.status
        ),
        // clear line, red battle and error, start of line
        BattleStatus::Failed { .. } => println!(
            "\x1b[2K\x1b[31m{}: {}\x1b[39m\x1b[0G",
            report.id, report.status
        ),
    }
}

fn print_running_battles(running: &[BattleId], programs: usize) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning ({programs} programs):\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(BattleId::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

#[cfg(test)]
mod tournament_scheduler_tests {
    use super::*;

    #[test]
    fn seeds_differ_between_battles_and_bases() {
        assert_ne!(battle_seed(0, 1), battle_seed(1, 0));
        assert_ne!(battle_seed(0, 1), battle_seed(0, 2));
        assert_eq!(battle_seed(42, 3), battle_seed(42, 3));
    }
}
