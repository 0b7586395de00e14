//! Adaptive signal controller.
//!
//! A cyclic state machine `Select -> Green -> Red -> Select` that gives the
//! busiest direction a green phase proportional to its share of demand.
//! The controller is the only writer of `SignalState`; observers follow it
//! through a watch channel.

use crate::error::InvalidParameterError;
use crate::ingest::LaneId;
use crate::metrics::WindowMetrics;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_GREEN_SECS: f64 = 5.0;
pub const DEFAULT_MAX_GREEN_SECS: f64 = 30.0;
pub const DEFAULT_CYCLE_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerParams {
    pub min_green_duration: f64,
    pub max_green_duration: f64,
    pub cycle_duration: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            min_green_duration: DEFAULT_MIN_GREEN_SECS,
            max_green_duration: DEFAULT_MAX_GREEN_SECS,
            cycle_duration: DEFAULT_CYCLE_SECS,
        }
    }
}

impl ControllerParams {
    pub fn validate(&self) -> Result<(), InvalidParameterError> {
        if !(self.min_green_duration.is_finite() && self.min_green_duration >= 0.0) {
            return Err(InvalidParameterError::Negative {
                name: "min_green_duration",
                value: self.min_green_duration,
            });
        }
        if !self.max_green_duration.is_finite() || self.max_green_duration < self.min_green_duration
        {
            return Err(InvalidParameterError::GreenBounds {
                min_green: self.min_green_duration,
                max_green: self.max_green_duration,
            });
        }
        if !(self.cycle_duration.is_finite() && self.cycle_duration > 0.0) {
            return Err(InvalidParameterError::NotPositive {
                name: "cycle_duration",
                value: self.cycle_duration,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionCount {
    pub direction: String,
    pub vehicle_count: u32,
}

/// Lanes that feed one signal direction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectionLanes {
    pub name: String,
    #[serde(default)]
    pub lanes: Vec<LaneId>,
}

/// Request body of a one-off planning call: latest counts plus timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerInput {
    pub sensors: Vec<DirectionCount>,
    pub parameters: ControllerParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionShare {
    pub direction: String,
    pub proportion: f64,
}

/// Outcome of the SELECT step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GreenAllocation {
    pub selected_direction: String,
    pub proportions: Vec<DirectionShare>,
    pub green_duration: f64,
    pub remaining: f64,
}

/// Pick the direction with the strictly largest share of `counts` (earlier
/// entries win ties) and size its green phase between the bounds.
pub fn allocate_green(
    counts: &[DirectionCount],
    params: &ControllerParams,
) -> Result<GreenAllocation, InvalidParameterError> {
    params.validate()?;
    let first = counts.first().ok_or(InvalidParameterError::NoDirections)?;

    let total: u64 = counts.iter().map(|c| u64::from(c.vehicle_count)).sum();
    let min_green = params.min_green_duration;
    let max_green = params.max_green_duration;

    if total == 0 {
        return Ok(GreenAllocation {
            selected_direction: first.direction.clone(),
            proportions: counts
                .iter()
                .map(|c| DirectionShare {
                    direction: c.direction.clone(),
                    proportion: 0.0,
                })
                .collect(),
            green_duration: min_green,
            remaining: (params.cycle_duration - min_green).max(0.0),
        });
    }

    let proportions: Vec<DirectionShare> = counts
        .iter()
        .map(|c| DirectionShare {
            direction: c.direction.clone(),
            proportion: f64::from(c.vehicle_count) / total as f64,
        })
        .collect();

    let mut selected = &proportions[0];
    for share in &proportions[1..] {
        if share.proportion > selected.proportion {
            selected = share;
        }
    }

    let green_duration =
        (min_green + selected.proportion * (max_green - min_green)).clamp(min_green, max_green);

    Ok(GreenAllocation {
        selected_direction: selected.direction.clone(),
        green_duration,
        remaining: (params.cycle_duration - green_duration).max(0.0),
        proportions,
    })
}

pub fn plan_cycle(input: &ControllerInput) -> Result<GreenAllocation, InvalidParameterError> {
    allocate_green(&input.sensors, &input.parameters)
}

/// Sum lane counts of one window into per-direction demand, in the
/// configured direction order.
pub fn direction_counts(metrics: &WindowMetrics, directions: &[DirectionLanes]) -> Vec<DirectionCount> {
    directions
        .iter()
        .map(|direction| DirectionCount {
            direction: direction.name.clone(),
            vehicle_count: direction
                .lanes
                .iter()
                .filter_map(|lane| metrics.lanes.get(lane))
                .map(|lane| lane.vehicle_count)
                .sum(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalPhase {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Light {
    Green,
    Red,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionLight {
    pub direction: String,
    pub light: Light,
}

/// Snapshot published on every observable transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalState {
    pub cycle: u64,
    pub selected_direction: Option<String>,
    pub green_duration: f64,
    pub phase: SignalPhase,
    pub remaining_in_cycle: f64,
    pub lights: Vec<DirectionLight>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    Select,
    Green(GreenAllocation),
    Red(GreenAllocation),
}

#[derive(Debug)]
pub struct SignalController {
    directions: Vec<String>,
    params: ControllerParams,
    counts: watch::Receiver<Vec<DirectionCount>>,
    state_tx: watch::Sender<Option<SignalState>>,
    state: ControllerState,
    cycle: u64,
}

impl SignalController {
    pub fn new(
        directions: Vec<String>,
        params: ControllerParams,
        counts: watch::Receiver<Vec<DirectionCount>>,
    ) -> Result<Self, InvalidParameterError> {
        if directions.is_empty() {
            return Err(InvalidParameterError::NoDirections);
        }
        params.validate()?;
        let (state_tx, _state_rx) = watch::channel(None);
        Ok(Self {
            directions,
            params,
            counts,
            state_tx,
            state: ControllerState::Select,
            cycle: 0,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SignalState>> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Latest demand in configured direction order; directions missing from
    /// the feed count as zero.
    fn current_counts(&self) -> Vec<DirectionCount> {
        let feed = self.counts.borrow();
        self.directions
            .iter()
            .map(|direction| DirectionCount {
                direction: direction.clone(),
                vehicle_count: feed
                    .iter()
                    .filter(|c| &c.direction == direction)
                    .map(|c| c.vehicle_count)
                    .sum(),
            })
            .collect()
    }

    /// Perform one transition and return how long the new state is held.
    pub fn step(&mut self) -> Duration {
        match std::mem::replace(&mut self.state, ControllerState::Select) {
            ControllerState::Select => {
                self.cycle += 1;
                let counts = self.current_counts();
                match allocate_green(&counts, &self.params) {
                    Ok(allocation) => {
                        info!(
                            cycle = self.cycle,
                            direction = %allocation.selected_direction,
                            green_secs = allocation.green_duration,
                            "Green phase selected"
                        );
                        self.publish(SignalPhase::Green, Some(&allocation));
                        let hold = secs(allocation.green_duration);
                        self.state = ControllerState::Green(allocation);
                        hold
                    }
                    Err(err) => {
                        warn!(cycle = self.cycle, error = %err, "Skipping cycle, holding all red");
                        self.publish(SignalPhase::Red, None);
                        secs(self.params.cycle_duration)
                    }
                }
            }
            ControllerState::Green(allocation) => {
                debug!(cycle = self.cycle, red_secs = allocation.remaining, "Red phase");
                self.publish(SignalPhase::Red, Some(&allocation));
                let hold = secs(allocation.remaining);
                self.state = ControllerState::Red(allocation);
                hold
            }
            ControllerState::Red(_) => Duration::ZERO,
        }
    }

    fn publish(&self, phase: SignalPhase, allocation: Option<&GreenAllocation>) {
        let green_for = match phase {
            SignalPhase::Green => allocation.map(|a| a.selected_direction.as_str()),
            SignalPhase::Red => None,
        };
        let lights = self
            .directions
            .iter()
            .map(|direction| DirectionLight {
                direction: direction.clone(),
                light: if green_for == Some(direction.as_str()) {
                    Light::Green
                } else {
                    Light::Red
                },
            })
            .collect();
        let remaining_in_cycle = match (phase, allocation) {
            (SignalPhase::Green, Some(a)) => a.green_duration + a.remaining,
            (SignalPhase::Red, Some(a)) => a.remaining,
            (_, None) => self.params.cycle_duration,
        };

        self.state_tx.send_replace(Some(SignalState {
            cycle: self.cycle,
            selected_direction: allocation.map(|a| a.selected_direction.clone()),
            green_duration: allocation.map(|a| a.green_duration).unwrap_or(0.0),
            phase,
            remaining_in_cycle,
            lights,
        }));
    }

    /// Drive the cycle until `cancel` fires. Cancellation is only observed
    /// between phases; a committed phase always runs to its end.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(directions = ?self.directions, "Signal controller started");
        loop {
            if cancel.is_cancelled() {
                info!(cycle = self.cycle, "Signal controller stopped");
                break;
            }
            let hold = self.step();
            if !hold.is_zero() {
                tokio::time::sleep(hold).await;
            }
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TimeWindow;
    use crate::metrics::{SignalTiming, intersection_capacity, lane_metrics};
    use std::collections::BTreeMap;

    const EPS: f64 = 1e-9;

    fn count(direction: &str, vehicle_count: u32) -> DirectionCount {
        DirectionCount {
            direction: direction.to_string(),
            vehicle_count,
        }
    }

    fn params() -> ControllerParams {
        ControllerParams {
            min_green_duration: 5.0,
            max_green_duration: 30.0,
            cycle_duration: 60.0,
        }
    }

    fn compass() -> Vec<String> {
        ["North", "South", "East", "West"]
            .iter()
            .map(|d| d.to_string())
            .collect()
    }

    #[test]
    fn busiest_direction_gets_proportional_green() -> Result<(), InvalidParameterError> {
        let counts = vec![
            count("North", 10),
            count("South", 5),
            count("East", 0),
            count("West", 0),
        ];

        let allocation = allocate_green(&counts, &params())?;

        assert_eq!(allocation.selected_direction, "North");
        assert!((allocation.proportions[0].proportion - 2.0 / 3.0).abs() < EPS);
        assert!((allocation.green_duration - (5.0 + 25.0 * 2.0 / 3.0)).abs() < EPS);
        assert!((allocation.remaining - (60.0 - allocation.green_duration)).abs() < EPS);
        let sum: f64 = allocation.proportions.iter().map(|s| s.proportion).sum();
        assert!((sum - 1.0).abs() < EPS);
        Ok(())
    }

    #[test]
    fn no_demand_selects_first_direction_at_min_green() -> Result<(), InvalidParameterError> {
        let counts = vec![count("North", 0), count("South", 0)];

        let allocation = allocate_green(&counts, &params())?;

        assert_eq!(allocation.selected_direction, "North");
        assert_eq!(allocation.green_duration, 5.0);
        assert_eq!(allocation.remaining, 55.0);
        Ok(())
    }

    #[test]
    fn ties_go_to_the_earlier_direction() -> Result<(), InvalidParameterError> {
        let counts = vec![count("East", 3), count("North", 7), count("West", 7)];

        let allocation = allocate_green(&counts, &params())?;

        assert_eq!(allocation.selected_direction, "North");
        Ok(())
    }

    #[test]
    fn green_stays_within_bounds_and_cycle_closes() -> Result<(), InvalidParameterError> {
        for north in [0, 1, 3, 10, 1000] {
            let counts = vec![count("North", north), count("South", 3)];
            let allocation = allocate_green(&counts, &params())?;
            assert!(allocation.green_duration >= 5.0);
            assert!(allocation.green_duration <= 30.0);
            assert!((allocation.green_duration + allocation.remaining - 60.0).abs() < EPS);
        }
        Ok(())
    }

    #[test]
    fn remaining_never_goes_negative() -> Result<(), InvalidParameterError> {
        let short_cycle = ControllerParams {
            cycle_duration: 10.0,
            ..params()
        };

        let allocation = allocate_green(&[count("North", 9)], &short_cycle)?;

        assert_eq!(allocation.green_duration, 30.0);
        assert_eq!(allocation.remaining, 0.0);
        Ok(())
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let inverted = ControllerParams {
            min_green_duration: 40.0,
            ..params()
        };
        let no_cycle = ControllerParams {
            cycle_duration: 0.0,
            ..params()
        };

        assert!(matches!(
            allocate_green(&[count("North", 1)], &inverted),
            Err(InvalidParameterError::GreenBounds { .. })
        ));
        assert!(matches!(
            allocate_green(&[count("North", 1)], &no_cycle),
            Err(InvalidParameterError::NotPositive { .. })
        ));
        assert_eq!(
            allocate_green(&[], &params()),
            Err(InvalidParameterError::NoDirections)
        );
    }

    #[test]
    fn controller_input_parses_the_published_shape() -> Result<(), Box<dyn std::error::Error>> {
        let body = r#"{
            "sensors": [
                {"direction": "North", "vehicle_count": 10},
                {"direction": "South", "vehicle_count": 5}
            ],
            "parameters": {"min_green_duration": 5, "max_green_duration": 30, "cycle_duration": 60}
        }"#;

        let input: ControllerInput = serde_json::from_str(body)?;
        let allocation = plan_cycle(&input)?;

        assert_eq!(allocation.selected_direction, "North");
        Ok(())
    }

    #[test]
    fn direction_counts_sum_configured_lanes() {
        let timing = SignalTiming {
            green_time: 30.0,
            red_time: 30.0,
            car_length: 5.0,
            saturation_flow: 0.25,
        };
        let lanes: BTreeMap<LaneId, _> = [(0, 2), (1, 1), (2, 4)]
            .into_iter()
            .map(|(lane, n)| (lane, lane_metrics(n, &timing)))
            .collect();
        let capacity = match intersection_capacity(lanes.len(), &timing) {
            Ok(capacity) => capacity,
            Err(err) => panic!("valid timing rejected: {err}"),
        };
        let metrics = WindowMetrics {
            window: TimeWindow::from_start_secs(0),
            lanes,
            total_flow_intensity: 7.0,
            capacity,
        };
        let directions = vec![
            DirectionLanes {
                name: "North".to_string(),
                lanes: vec![0, 1],
            },
            DirectionLanes {
                name: "East".to_string(),
                lanes: vec![2, 9],
            },
        ];

        let counts = direction_counts(&metrics, &directions);

        assert_eq!(counts, vec![count("North", 3), count("East", 4)]);
    }

    #[test]
    fn step_walks_select_green_red_select() -> Result<(), InvalidParameterError> {
        let (_tx, rx) = watch::channel(vec![count("South", 4)]);
        let mut controller = SignalController::new(compass(), params(), rx)?;
        let states = controller.subscribe();

        let green_hold = controller.step();
        let green = states.borrow().clone();
        assert!(matches!(controller.state(), ControllerState::Green(_)));
        let red_hold = controller.step();
        let red = states.borrow().clone();
        assert!(matches!(controller.state(), ControllerState::Red(_)));
        let select_hold = controller.step();

        assert_eq!(green_hold, Duration::from_secs(30));
        assert_eq!(red_hold, Duration::from_secs(30));
        assert_eq!(select_hold, Duration::ZERO);
        assert_eq!(controller.state(), &ControllerState::Select);

        let green = green.ok_or(InvalidParameterError::NoDirections)?;
        assert_eq!(green.phase, SignalPhase::Green);
        assert_eq!(green.selected_direction.as_deref(), Some("South"));
        let lit: Vec<_> = green
            .lights
            .iter()
            .filter(|l| l.light == Light::Green)
            .map(|l| l.direction.as_str())
            .collect();
        assert_eq!(lit, vec!["South"]);
        assert_eq!(green.remaining_in_cycle, 60.0);

        let red = red.ok_or(InvalidParameterError::NoDirections)?;
        assert_eq!(red.phase, SignalPhase::Red);
        assert!(red.lights.iter().all(|l| l.light == Light::Red));
        assert_eq!(red.remaining_in_cycle, 30.0);
        Ok(())
    }

    #[test]
    fn controller_requires_directions() {
        let (_tx, rx) = watch::channel(Vec::new());

        let result = SignalController::new(Vec::new(), params(), rx);

        assert!(matches!(result, Err(InvalidParameterError::NoDirections)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_follows_the_cycle_timing() -> Result<(), Box<dyn std::error::Error>> {
        let (_tx, rx) = watch::channel(vec![count("North", 10), count("South", 5)]);
        let controller = SignalController::new(compass(), params(), rx)?;
        let mut states = controller.subscribe();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        states.changed().await?;
        let first = states.borrow_and_update().clone();
        states.changed().await?;
        let red_at = start.elapsed();
        let second = states.borrow_and_update().clone();
        states.changed().await?;
        let next_green_at = start.elapsed();
        cancel.cancel();
        handle.await?;

        assert_eq!(first.map(|s| s.phase), Some(SignalPhase::Green));
        assert_eq!(second.map(|s| s.phase), Some(SignalPhase::Red));
        let green_secs = 5.0 + 25.0 * 2.0 / 3.0;
        assert!((red_at.as_secs_f64() - green_secs).abs() < 0.01);
        assert!((next_green_at.as_secs_f64() - 60.0).abs() < 0.01);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_waits_for_the_phase_boundary() -> Result<(), Box<dyn std::error::Error>> {
        let (_tx, rx) = watch::channel(vec![count("East", 1)]);
        let controller = SignalController::new(compass(), params(), rx)?;
        let mut states = controller.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        states.changed().await?;
        let green_started = tokio::time::Instant::now();
        cancel.cancel();
        handle.await?;

        assert!(green_started.elapsed() >= Duration::from_secs(30));
        let last = states.borrow().clone();
        assert_eq!(last.map(|s| s.phase), Some(SignalPhase::Green));
        Ok(())
    }
}
