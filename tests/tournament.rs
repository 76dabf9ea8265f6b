use std::{
    collections::HashSet,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use battle_engine::{
    battle::{BattleStatus, CancelScope},
    prelude::*,
    progress::ProgressEvent,
    scoring::ScoreFault,
};

use common::{build, constraints, init_test_logger, quiet, team, ScriptedSandbox, Sum};

mod common;

fn tournament(
    protocol: impl Into<ProtocolConfig>,
    constraints: ConstraintsBuilder,
    sandbox: &Arc<ScriptedSandbox>,
) -> Tournament {
    Tournament::new(Arc::new(Sum), protocol, build(constraints), quiet())
        .with_sandbox(sandbox.clone())
}

fn assert_reported_once(report: &battle_engine::tournament::TournamentReport, expected: usize) {
    assert_eq!(report.reports.len(), expected);
    let ids = report
        .reports
        .iter()
        .map(|r| r.id.clone())
        .collect::<HashSet<_>>();
    assert_eq!(ids.len(), expected, "a battle was reported twice");
}

#[test]
fn capacities_of_two_teams() {
    init_test_logger();
    let sandbox = ScriptedSandbox::new();
    let teams = vec![team("a", "gen", "sol-upto-5"), team("b", "gen", "sol-upto-2")];
    let protocol = IterativeCapacity::new().with_failure_streak(2);

    let report = tournament(protocol, constraints(4), &sandbox)
        .run(&teams)
        .unwrap();

    assert_reported_once(&report, 2);
    assert!(report.infrastructure_failures.is_empty());
    let b_solves = report.battle("a", "b").unwrap();
    assert_eq!(b_solves.status, BattleStatus::Concluded);
    assert_eq!(b_solves.score.as_ref().unwrap().capacity(), Some(2));
    assert_eq!(b_solves.history.len(), 4);
    let a_solves = report.battle("b", "a").unwrap();
    assert_eq!(a_solves.score.as_ref().unwrap().capacity(), Some(5));

    let standings = report.standings(Combination::PairwisePoints { achievable: 100.0 });
    assert_eq!(standings.teams[0].team, "a");
    assert!((standings.get("a").unwrap() - 500.0 / 7.0).abs() < 1e-9);
}

#[test]
fn accelerating_search_finds_each_capacity() {
    let sandbox = ScriptedSandbox::new();
    let teams = vec![team("a", "gen", "sol-upto-10"), team("b", "gen", "sol-upto-37")];
    let protocol = IterativeCapacity::new()
        .with_exponent(2)
        .with_failure_streak(1);

    let report = tournament(protocol, constraints(2), &sandbox)
        .run(&teams)
        .unwrap();

    let capacity = |generator, solver| {
        report
            .battle(generator, solver)
            .and_then(|b| b.score.as_ref())
            .and_then(|s| s.capacity())
    };
    assert_eq!(capacity("b", "a"), Some(10));
    assert_eq!(capacity("a", "b"), Some(37));
    // far fewer rounds than a linear search
    assert!(report.battle("a", "b").unwrap().history.len() < 15);
}

#[test]
fn a_lone_team_battles_itself() {
    let sandbox = ScriptedSandbox::new();
    let teams = vec![team("solo", "gen", "sol-upto-3")];
    let report = tournament(IterativeCapacity::new(), constraints(1), &sandbox)
        .run(&teams)
        .unwrap();
    assert_reported_once(&report, 1);
    assert_eq!(report.reports[0].score.as_ref().unwrap().capacity(), Some(3));
}

#[test]
fn repetitions_use_fresh_seeds() {
    let sandbox = ScriptedSandbox::new();
    let teams = vec![team("a", "gen", "sol"), team("b", "gen", "sol")];
    let report = tournament(FixedSizeRepeated::new(3, 2), constraints(2), &sandbox)
        .with_repetitions(3)
        .run(&teams)
        .unwrap();
    assert_reported_once(&report, 6);
    let seeds = report
        .reports
        .iter()
        .flat_map(|r| r.history.iter().map(|round| round.seed))
        .collect::<HashSet<_>>();
    assert_eq!(seeds.len(), 12);
}

#[test]
fn never_more_programs_than_the_budget() {
    init_test_logger();
    let sandbox = ScriptedSandbox::with_delay(Duration::from_millis(3));
    let teams = (0..6)
        .map(|i| team(&format!("team{i}"), "gen", "sol"))
        .collect::<Vec<_>>();

    let report = tournament(FixedSizeRepeated::new(4, 3), constraints(3), &sandbox)
        .run(&teams)
        .unwrap();

    assert_reported_once(&report, 30);
    assert!(report
        .reports
        .iter()
        .all(|r| r.status == BattleStatus::Concluded));
    assert_eq!(sandbox.invocations(), 30 * 3 * 2);
    assert!(sandbox.peak() <= 3, "peak was {}", sandbox.peak());
}

#[test]
fn generator_crashing_everywhere() {
    let sandbox = ScriptedSandbox::new();
    let teams = vec![team("broken", "gen-crash", "sol"), team("fine", "gen", "sol")];
    let protocol = IterativeCapacity::new().with_max_rounds(8);

    let report = tournament(protocol, constraints(2), &sandbox)
        .run(&teams)
        .unwrap();

    let crashed = report.battle("broken", "fine").unwrap();
    assert_eq!(crashed.status, BattleStatus::Concluded);
    assert_eq!(crashed.history.len(), 8);
    let score = crashed.score.as_ref().unwrap();
    assert_eq!(score.capacity(), Some(0));
    assert_eq!(score.solver_rounds, 0);
    assert_eq!(score.generator_faults, 8);
    assert_eq!(score.fault, ScoreFault::NoValidInstance);

    let fine = report.battle("fine", "broken").unwrap();
    assert_eq!(fine.score.as_ref().unwrap().fault, ScoreFault::None);
}

#[test]
fn infrastructure_errors_stay_in_their_battle() {
    let sandbox = ScriptedSandbox::new();
    let teams = vec![
        team("a", "gen", "sol-upto-2"),
        team("b", "gen", "sol-broken"),
        team("c", "gen", "sol-upto-4"),
    ];
    let report = tournament(IterativeCapacity::new(), constraints(2), &sandbox)
        .run(&teams)
        .unwrap();

    assert_reported_once(&report, 6);
    assert_eq!(report.infrastructure_failures.len(), 2);
    for failure in &report.infrastructure_failures {
        assert_eq!(failure.battle.solver.name, "b");
        assert!(failure.error.contains("could not start"));
    }
    assert_eq!(report.scores().count(), 4);
    assert_eq!(
        report.battle("a", "c").unwrap().score.as_ref().unwrap().capacity(),
        Some(4)
    );
}

#[test]
fn explicit_cancellation_reports_every_battle() {
    init_test_logger();
    let sandbox = ScriptedSandbox::with_delay(Duration::from_millis(5));
    let teams = (0..4)
        .map(|i| team(&format!("team{i}"), "gen", "sol-upto-1000"))
        .collect::<Vec<_>>();
    let protocol = IterativeCapacity::new().with_max_rounds(10_000);
    let (tx, rx) = mpsc::channel();
    let tournament = tournament(protocol, constraints(2), &sandbox).with_progress(tx);

    let handle = tournament.handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        handle.cancel();
    });
    let report = tournament.run(&teams).unwrap();
    canceller.join().unwrap();

    assert_reported_once(&report, 12);
    for battle in &report.reports {
        assert_eq!(
            battle.status,
            BattleStatus::Cancelled {
                scope: CancelScope::Tournament
            }
        );
        assert!(battle.score.is_none());
    }
    assert!(report.reports.iter().any(|r| !r.history.is_empty()));

    drop(tournament);
    let finished = rx
        .iter()
        .filter(|event| matches!(event, ProgressEvent::BattleFinished { .. }))
        .count();
    assert_eq!(finished, 12);
}

#[test]
fn tournament_deadline_keeps_concluded_battles() {
    let sandbox = ScriptedSandbox::with_delay(Duration::from_millis(2));
    let teams = vec![
        team("quick", "gen", "sol-upto-1"),
        team("slow", "gen", "sol-upto-100000"),
    ];
    let protocol = IterativeCapacity::new()
        .with_failure_streak(1)
        .with_max_rounds(100_000);
    let constraints = constraints(2).with_tournament_deadline(Duration::from_millis(300));

    let report = tournament(protocol, constraints, &sandbox)
        .run(&teams)
        .unwrap();

    assert_reported_once(&report, 2);
    let quick = report.battle("slow", "quick").unwrap();
    assert_eq!(quick.status, BattleStatus::Concluded);
    assert_eq!(quick.score.as_ref().unwrap().capacity(), Some(1));
    let slow = report.battle("quick", "slow").unwrap();
    assert_eq!(
        slow.status,
        BattleStatus::Cancelled {
            scope: CancelScope::Tournament
        }
    );
    assert!(slow.score.is_none());
}

#[test]
fn battle_deadline_scores_partial_history() {
    let sandbox = ScriptedSandbox::with_delay(Duration::from_millis(2));
    let teams = vec![team("a", "gen", "sol"), team("b", "gen", "sol")];
    let protocol = IterativeCapacity::new().with_max_rounds(100_000);
    let constraints = constraints(2).with_battle_deadline(Duration::from_millis(100));

    let report = tournament(protocol, constraints, &sandbox)
        .run(&teams)
        .unwrap();

    assert_reported_once(&report, 2);
    for battle in &report.reports {
        assert_eq!(
            battle.status,
            BattleStatus::Cancelled {
                scope: CancelScope::Battle
            }
        );
        let score = battle.score.as_ref().unwrap();
        assert!(score.capacity().unwrap() > 0);
        assert!(score.rounds <= battle.history.len());
    }
}

#[test]
fn configuration_errors_abort_before_running() {
    let sandbox = ScriptedSandbox::new();
    let run = |teams: Vec<Arc<Team>>, protocol: ProtocolConfig| {
        tournament(protocol, constraints(2), &sandbox).run(&teams)
    };

    assert!(run(vec![], IterativeCapacity::new().into()).is_err());
    assert!(run(
        vec![team("a", "gen", "sol"), team("a", "gen", "sol")],
        IterativeCapacity::new().into()
    )
    .is_err());
    assert!(run(
        vec![team("a", "gen", "sol")],
        IterativeCapacity::new().with_step(0).into()
    )
    .is_err());

    let missing = run(
        vec![team("a", "gen", "sol"), team("b", "gen", "missing")],
        IterativeCapacity::new().into(),
    )
    .unwrap_err();
    assert!(format!("{missing:#}").contains("solver of team 'b'"));

    assert_eq!(sandbox.invocations(), 0);
}
