use exo_perception::config::{ParameterRange, StaircaseConfig};
use exo_perception::trial::response::Response;
use exo_perception::trial::staircase::{
    Direction, SameResponse, StaircaseController, StaircaseState,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Observer who feels assistance as late whenever it starts before `threshold`.
fn observer(threshold: f64) -> impl Fn(f64) -> Response {
    move |value| {
        if value < threshold {
            Response::Later
        } else {
            Response::Earlier
        }
    }
}

fn run_to_convergence(sc: &mut StaircaseController, respond: impl Fn(f64) -> Response) -> u32 {
    let mut trials = 0;
    while !sc.is_converged() && trials < sc.config().max_trials {
        let v = sc.begin_presentation().unwrap();
        sc.respond(respond(v)).unwrap();
        trials += 1;
    }
    trials
}

fn halving_config() -> StaircaseConfig {
    StaircaseConfig {
        parameter_range: ParameterRange::new(10.0, 40.0),
        initial_step_size: 2.0,
        reversals_per_reduction: 2,
        step_reduction_factor: 0.5,
        min_step_size: 0.25,
        reversal_target: 8,
        threshold_reversals: 6,
        ..StaircaseConfig::default()
    }
}

#[test]
fn recorded_response_sequence() {
    let cfg = StaircaseConfig {
        parameter_range: ParameterRange::new(0.0, 40.0),
        initial_step_size: 2.0,
        ..StaircaseConfig::default()
    };
    let mut sc = StaircaseController::new(cfg, 20.0).unwrap();
    use Response::{Earlier, Later};
    for r in [Later, Later, Earlier, Earlier, Later] {
        sc.begin_presentation().unwrap();
        sc.respond(r).unwrap();
    }
    assert_eq!(sc.history(), &[22.0, 24.0, 22.0, 20.0, 22.0]);
    assert_eq!(sc.reversal_values(), &[24.0, 20.0]);
    assert_eq!(sc.state(), StaircaseState::Running);
}

#[test]
fn halving_staircase_brackets_observer_threshold() {
    let mut sc = StaircaseController::new(halving_config(), 20.0).unwrap();
    let trials = run_to_convergence(&mut sc, observer(27.0));
    assert_eq!(trials, 13);
    assert_eq!(
        sc.reversal_values(),
        &[28.0, 26.0, 28.0, 26.0, 27.0, 26.5, 27.0, 26.75]
    );
    assert_eq!(sc.threshold(), Some(26.875));
    assert_eq!(sc.step_size(), 0.25);
}

#[test]
fn initial_direction_counts_first_turn() {
    let cfg = StaircaseConfig {
        initial_direction: Direction::Down,
        ..halving_config()
    };
    let mut sc = StaircaseController::new(cfg, 20.0).unwrap();
    run_to_convergence(&mut sc, observer(27.0));
    assert_eq!(sc.reversal_values()[0], 20.0);
    assert_eq!(sc.reversal_count(), 8);
    let thr = sc.threshold().unwrap();
    assert!((thr - 27.0).abs() < 1.0, "{thr}");
}

#[test]
fn threshold_tracks_observer_from_below() {
    let mut sc = StaircaseController::new(halving_config(), 20.0).unwrap();
    run_to_convergence(&mut sc, observer(13.3));
    let thr = sc.threshold().unwrap();
    assert!((thr - 13.3).abs() < 0.5, "{thr}");
    assert!(sc.reversal_values().iter().all(|v| (12.0..=20.0).contains(v)));
}

#[test]
fn unreachable_threshold_pins_to_range_edge() {
    let cfg = StaircaseConfig {
        max_trials: 30,
        ..halving_config()
    };
    let mut sc = StaircaseController::new(cfg, 20.0).unwrap();
    let trials = run_to_convergence(&mut sc, observer(100.0));
    assert_eq!(trials, 30);
    assert!(!sc.is_converged());
    assert_eq!(sc.current_value(), 40.0);
    assert_eq!(sc.reversal_count(), 0);
    assert_eq!(sc.threshold(), None);
}

#[test]
fn random_responses_never_leave_the_range() {
    for (seed, same_response, step) in [
        (7_u64, SameResponse::Hold, 2.0),
        (11, SameResponse::Continue, 7.5),
        (23, SameResponse::Continue, 45.0),
    ] {
        let cfg = StaircaseConfig {
            parameter_range: ParameterRange::new(10.0, 40.0),
            initial_step_size: step,
            reversals_per_reduction: 3,
            step_reduction_factor: 0.8,
            min_step_size: 0.5,
            reversal_target: u32::MAX,
            same_response,
            ..StaircaseConfig::default()
        };
        let range = cfg.parameter_range;
        let mut sc = StaircaseController::new(cfg, 25.0).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        for trial in 0..10_000 {
            let presented = sc.begin_presentation().unwrap();
            assert!(range.contains(presented), "seed {seed} trial {trial}: {presented}");
            let response = match rng.random_range(0..3) {
                0 => Response::Earlier,
                1 => Response::Same,
                _ => Response::Later,
            };
            sc.respond(response).unwrap();
            assert!(
                range.contains(sc.current_value()),
                "seed {seed} trial {trial}: {}",
                sc.current_value()
            );
        }
        assert!(!sc.is_converged());
    }
}
