//! Flow and queue metrics over closed windows.
//!
//! Every lane is treated with the deterministic saturation-flow model:
//!
//! ```text
//! flow_rate        = count / window length (1 s)
//! queue_vehicles   = flow_rate * red_time
//! queue_length_m   = queue_vehicles * car_length
//! queue_length_sec = queue_vehicles / saturation_flow
//! queue_growth     = flow_rate * car_length
//! queue_delay_sec  = queue_vehicles / (2 * saturation_flow)
//! total_capacity   = lane_count * saturation_flow * green_time / cycle_time
//! ```

use crate::aggregate::{ClosedWindow, TimeWindow};
use crate::error::{AppError, InvalidParameterError};
use crate::ingest::LaneId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Vehicles per second a queued lane discharges during green.
pub const SECONDS_PER_HOUR: f64 = 3600.0;

pub const DEFAULT_SATURATION_FLOW: f64 = 0.25;

/// Static signal timing the queue model is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalTiming {
    pub green_time: f64,
    pub red_time: f64,
    pub car_length: f64,
    pub saturation_flow: f64,
}

impl SignalTiming {
    pub fn new(
        green_time: f64,
        red_time: f64,
        car_length: f64,
        saturation_flow: Option<f64>,
    ) -> Result<Self, InvalidParameterError> {
        let timing = Self {
            green_time,
            red_time,
            car_length,
            saturation_flow: saturation_flow.unwrap_or(DEFAULT_SATURATION_FLOW),
        };
        timing.validate()?;
        Ok(timing)
    }

    pub fn validate(&self) -> Result<(), InvalidParameterError> {
        if !(self.saturation_flow.is_finite() && self.saturation_flow > 0.0) {
            return Err(InvalidParameterError::NotPositive {
                name: "saturation_flow",
                value: self.saturation_flow,
            });
        }
        non_negative("green_time", self.green_time)?;
        non_negative("red_time", self.red_time)?;
        non_negative("car_length", self.car_length)?;
        let cycle_time = self.cycle_time();
        if cycle_time <= 0.0 {
            return Err(InvalidParameterError::NotPositive {
                name: "cycle_time",
                value: cycle_time,
            });
        }
        Ok(())
    }

    pub fn cycle_time(&self) -> f64 {
        self.green_time + self.red_time
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), InvalidParameterError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(InvalidParameterError::Negative { name, value })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LaneMetrics {
    pub vehicle_count: u32,
    pub flow_rate: f64,
    pub queue_vehicle_count: f64,
    pub queue_length_m: f64,
    pub queue_length_sec: f64,
    pub queue_growth_rate: f64,
    pub queue_delay_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntersectionCapacity {
    pub lane_count: usize,
    pub saturation_flow: f64,
    pub green_time: f64,
    pub red_time: f64,
    pub cycle_time: f64,
    pub total_capacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowMetrics {
    pub window: TimeWindow,
    pub lanes: BTreeMap<LaneId, LaneMetrics>,
    pub total_flow_intensity: f64,
    pub capacity: IntersectionCapacity,
}

/// Metrics for one lane given its distinct-vehicle count in a window.
/// `timing` is assumed validated.
pub fn lane_metrics(vehicle_count: u32, timing: &SignalTiming) -> LaneMetrics {
    let flow_rate = f64::from(vehicle_count) / TimeWindow::LENGTH_SECS as f64;
    let queue_vehicle_count = flow_rate * timing.red_time;
    LaneMetrics {
        vehicle_count,
        flow_rate,
        queue_vehicle_count,
        queue_length_m: queue_vehicle_count * timing.car_length,
        queue_length_sec: queue_vehicle_count / timing.saturation_flow,
        queue_growth_rate: flow_rate * timing.car_length,
        queue_delay_sec: queue_vehicle_count / (2.0 * timing.saturation_flow),
    }
}

pub fn intersection_capacity(
    lane_count: usize,
    timing: &SignalTiming,
) -> Result<IntersectionCapacity, InvalidParameterError> {
    timing.validate()?;
    let cycle_time = timing.cycle_time();
    Ok(IntersectionCapacity {
        lane_count,
        saturation_flow: timing.saturation_flow,
        green_time: timing.green_time,
        red_time: timing.red_time,
        cycle_time,
        total_capacity: lane_count as f64 * timing.saturation_flow * (timing.green_time / cycle_time),
    })
}

/// Metrics for every lane in `lanes` plus any lane the window itself saw,
/// whether or not it had traffic. Parameters are checked before any queue
/// quantity is derived.
pub fn compute_window_metrics(
    window: &ClosedWindow,
    lanes: &BTreeSet<LaneId>,
    timing: &SignalTiming,
) -> Result<WindowMetrics, InvalidParameterError> {
    let mut covered = lanes.clone();
    covered.extend(window.lanes());
    let capacity = intersection_capacity(covered.len(), timing)?;

    let mut per_lane = BTreeMap::new();
    let mut total_flow_intensity = 0.0;
    for lane_id in covered {
        let metrics = lane_metrics(window.vehicle_count(lane_id), timing);
        total_flow_intensity += f64::from(metrics.vehicle_count);
        per_lane.insert(lane_id, metrics);
    }

    Ok(WindowMetrics {
        window: window.window,
        lanes: per_lane,
        total_flow_intensity,
        capacity,
    })
}

/// Fan the windows out over tokio tasks and return the results in the input
/// order, whatever order the tasks finish in.
pub async fn compute_windows_parallel(
    windows: Vec<Arc<ClosedWindow>>,
    lanes: Arc<BTreeSet<LaneId>>,
    timing: SignalTiming,
) -> Result<Vec<Result<WindowMetrics, InvalidParameterError>>, AppError> {
    let mut tasks = JoinSet::new();
    let count = windows.len();
    for (index, window) in windows.into_iter().enumerate() {
        let lanes = Arc::clone(&lanes);
        tasks.spawn(async move { (index, compute_window_metrics(&window, &lanes, &timing)) });
    }

    let mut slots: Vec<Option<Result<WindowMetrics, InvalidParameterError>>> =
        (0..count).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|err| AppError::Task(err.to_string()))?;
        slots[index] = Some(result);
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| AppError::Task("window result missing".to_string())))
        .collect()
}

/// Per-lane mean flow over the observed windows (`sum of counts / windows`).
/// Kept apart from the instantaneous per-window figures.
pub fn average_flow_rates<'a, I>(windows: I, lanes: &BTreeSet<LaneId>) -> BTreeMap<LaneId, f64>
where
    I: IntoIterator<Item = &'a ClosedWindow>,
{
    let mut totals: BTreeMap<LaneId, u64> = lanes.iter().map(|&lane| (lane, 0)).collect();
    let mut observed = 0u64;
    for window in windows {
        observed += 1;
        for (lane, total) in totals.iter_mut() {
            *total += u64::from(window.vehicle_count(*lane));
        }
    }

    totals
        .into_iter()
        .map(|(lane, total)| {
            let average = if observed == 0 {
                0.0
            } else {
                total as f64 / observed as f64
            };
            (lane, average)
        })
        .collect()
}

pub fn total_average_flow(averages: &BTreeMap<LaneId, f64>) -> f64 {
    averages.values().sum()
}

/// Scale per-second averages to vehicles per hour.
pub fn per_hour(averages: &BTreeMap<LaneId, f64>) -> BTreeMap<LaneId, f64> {
    averages
        .iter()
        .map(|(&lane, &per_second)| (lane, per_second * SECONDS_PER_HOUR))
        .collect()
}
