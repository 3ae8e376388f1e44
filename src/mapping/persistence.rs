//! Persistence of the mapping graph: binary dumps of the serializable
//! subgraph and estimate, text descriptors for matching-cost factors, and
//! the repair pass that reconstructs a usable graph from partially corrupted
//! state.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use tracing::{error, info, warn};

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::registration::StreamBufferRoundRobin;
use crate::factors::{
    BiasBetweenFactor, BiasPriorFactor, Factor, ImuChainFactor, LinearDampingFactor,
    MatchingCostKind, NoiseModel, PoseBetweenFactor, PosePriorFactor, RotateVectorFactor,
    VelocityBetweenFactor,
};
use crate::mapping::builder::{prepare_submap, registration_factors_for_pair};
use crate::mapping::config::GlobalMappingConfig;
use crate::pointcloud::PointCloud;
use crate::submap::{Submap, SubmapIoError};

/// Persistence error types.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Submap(#[from] SubmapIoError),

    #[error("malformed graph header: {0}")]
    MalformedHeader(String),
}

/// Serialized mirror of the factors whose state is self-contained.
#[derive(Serialize, Deserialize)]
enum StoredFactor {
    LinearDamping(LinearDampingFactor),
    PosePrior(PosePriorFactor),
    PoseBetween(PoseBetweenFactor),
    BiasPrior(BiasPriorFactor),
    BiasBetween(BiasBetweenFactor),
    VelocityBetween(VelocityBetweenFactor),
    RotateVector(RotateVectorFactor),
    ImuChain(ImuChainFactor),
}

impl StoredFactor {
    fn from_factor(factor: &Factor) -> Option<StoredFactor> {
        match factor {
            Factor::LinearDamping(f) => Some(StoredFactor::LinearDamping(f.clone())),
            Factor::PosePrior(f) => Some(StoredFactor::PosePrior(f.clone())),
            Factor::PoseBetween(f) => Some(StoredFactor::PoseBetween(f.clone())),
            Factor::BiasPrior(f) => Some(StoredFactor::BiasPrior(f.clone())),
            Factor::BiasBetween(f) => Some(StoredFactor::BiasBetween(f.clone())),
            Factor::VelocityBetween(f) => Some(StoredFactor::VelocityBetween(f.clone())),
            Factor::RotateVector(f) => Some(StoredFactor::RotateVector(f.clone())),
            Factor::ImuChain(f) => Some(StoredFactor::ImuChain(f.clone())),
            Factor::Gicp(_) | Factor::Vgicp(_) => None,
        }
    }

    fn into_factor(self) -> Factor {
        match self {
            StoredFactor::LinearDamping(f) => Factor::LinearDamping(f),
            StoredFactor::PosePrior(f) => Factor::PosePrior(f),
            StoredFactor::PoseBetween(f) => Factor::PoseBetween(f),
            StoredFactor::BiasPrior(f) => Factor::BiasPrior(f),
            StoredFactor::BiasBetween(f) => Factor::BiasBetween(f),
            StoredFactor::VelocityBetween(f) => Factor::VelocityBetween(f),
            StoredFactor::RotateVector(f) => Factor::RotateVector(f),
            StoredFactor::ImuChain(f) => Factor::ImuChain(f),
        }
    }
}

/// Everything `load` reconstructs before the smoother update.
pub(crate) struct LoadedState {
    pub submaps: Vec<Submap>,
    pub subsampled_submaps: Vec<Arc<PointCloud>>,
    pub graph: FactorGraph,
    pub values: Values,
    pub needs_recover: bool,
}

fn submap_dir(path: &Path, index: usize) -> std::path::PathBuf {
    path.join(format!("{index:06}"))
}

/// Write the full persisted layout under `path`.
pub(crate) fn save(
    path: &Path,
    factors: &FactorGraph,
    estimate: &Values,
    submaps: &[Submap],
    config: &GlobalMappingConfig,
) -> Result<(), PersistenceError> {
    fs::create_dir_all(path)?;

    let mut serializable = Vec::new();
    // Per-level registration factors of a pair collapse into one descriptor.
    let mut matching_cost: std::collections::BTreeMap<(u64, u64), MatchingCostKind> =
        std::collections::BTreeMap::new();

    for factor in factors.iter() {
        if let Some(stored) = StoredFactor::from_factor(factor) {
            serializable.push(stored);
        } else if let Some((kind, i, j)) = factor.matching_cost_descriptor() {
            matching_cost.insert((i, j), kind);
        }
    }

    info!("serializing factor graph to {}/graph.bin", path.display());
    let graph_file = fs::File::create(path.join("graph.bin"))?;
    bincode::serialize_into(BufWriter::new(graph_file), &serializable)?;

    let values_file = fs::File::create(path.join("values.bin"))?;
    bincode::serialize_into(BufWriter::new(values_file), estimate)?;

    let num_all_frames: usize = submaps.iter().map(|s| s.optim_odom_frames.len()).sum();
    let mut graph_txt = BufWriter::new(fs::File::create(path.join("graph.txt"))?);
    writeln!(graph_txt, "num_submaps: {}", submaps.len())?;
    writeln!(graph_txt, "num_all_frames: {num_all_frames}")?;
    writeln!(graph_txt, "num_matching_cost_factors: {}", matching_cost.len())?;
    for ((i, j), kind) in &matching_cost {
        writeln!(graph_txt, "matching_cost {kind} {i} {j}")?;
    }
    graph_txt.flush()?;

    for (i, submap) in submaps.iter().enumerate() {
        submap.save(&submap_dir(path, i))?;
    }

    info!("saving config");
    let config_dir = path.join("config");
    fs::create_dir_all(&config_dir)?;
    let config_file = fs::File::create(config_dir.join("global_mapping.json"))?;
    serde_json::to_writer_pretty(BufWriter::new(config_file), config)?;

    Ok(())
}

fn parse_header_line(line: &str, expected: &str) -> Result<usize, PersistenceError> {
    let mut parts = line.split_whitespace();
    let token = parts
        .next()
        .ok_or_else(|| PersistenceError::MalformedHeader(format!("missing {expected}")))?;
    if token.trim_end_matches(':') != expected {
        return Err(PersistenceError::MalformedHeader(format!(
            "expected {expected}, got {token}"
        )));
    }
    parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| PersistenceError::MalformedHeader(format!("bad value for {expected}")))
}

/// Read back the persisted layout. Deserialization failures of the binary
/// dumps are logged and flagged for recovery instead of aborting the load.
pub(crate) fn load(
    path: &Path,
    config: &GlobalMappingConfig,
    stream_pool: &StreamBufferRoundRobin,
    rng: &mut StdRng,
) -> Result<LoadedState, PersistenceError> {
    let file = fs::File::open(path.join("graph.txt"))?;
    let mut lines = BufReader::new(file).lines();

    let mut next_line = || -> Result<String, PersistenceError> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| PersistenceError::MalformedHeader("truncated graph.txt".into()))
    };

    let num_submaps = parse_header_line(&next_line()?, "num_submaps")?;
    let num_all_frames = parse_header_line(&next_line()?, "num_all_frames")?;
    let num_matching_cost_factors = parse_header_line(&next_line()?, "num_matching_cost_factors")?;
    info!(num_submaps, num_all_frames, num_matching_cost_factors, "loading graph");

    let mut descriptors = Vec::with_capacity(num_matching_cost_factors);
    for _ in 0..num_matching_cost_factors {
        let line = next_line()?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 4 || parts[0] != "matching_cost" {
            return Err(PersistenceError::MalformedHeader(format!(
                "bad matching cost line: {line}"
            )));
        }
        let i: usize = parts[2].parse().map_err(|_| {
            PersistenceError::MalformedHeader(format!("bad index in: {line}"))
        })?;
        let j: usize = parts[3].parse().map_err(|_| {
            PersistenceError::MalformedHeader(format!("bad index in: {line}"))
        })?;
        descriptors.push((parts[1].to_string(), i, j));
    }

    info!("Load submaps");
    let mut submaps = Vec::with_capacity(num_submaps);
    let mut subsampled_submaps = Vec::with_capacity(num_submaps);
    for i in 0..num_submaps {
        let mut submap = Submap::load(&submap_dir(path, i))?;
        let subsampled = prepare_submap(&mut submap, config, rng);
        submaps.push(submap);
        subsampled_submaps.push(subsampled);
    }

    let mut needs_recover = false;

    info!("deserializing factor graph");
    let mut graph = FactorGraph::new();
    match fs::File::open(path.join("graph.bin"))
        .map_err(PersistenceError::from)
        .and_then(|f| {
            bincode::deserialize_from::<_, Vec<StoredFactor>>(BufReader::new(f))
                .map_err(PersistenceError::from)
        }) {
        Ok(stored) => {
            for factor in stored {
                graph.add(factor.into_factor());
            }
        }
        Err(e) => {
            error!("failed to deserialize factor graph: {e}");
            needs_recover = true;
        }
    }

    info!("deserializing values");
    let mut values = Values::new();
    match fs::File::open(path.join("values.bin"))
        .map_err(PersistenceError::from)
        .and_then(|f| {
            bincode::deserialize_from::<_, Values>(BufReader::new(f)).map_err(PersistenceError::from)
        }) {
        Ok(loaded) => values = loaded,
        Err(e) => {
            error!("failed to deserialize values: {e}");
            needs_recover = true;
        }
    }

    info!("creating matching cost factors");
    let mut dropped = 0usize;
    for (kind, i, j) in descriptors {
        match kind.parse::<MatchingCostKind>() {
            Ok(MatchingCostKind::Vgicp) | Ok(MatchingCostKind::VgicpGpu) => {
                if i >= submaps.len() || j >= submaps.len() {
                    warn!(i, j, "matching cost factor references missing submaps");
                    dropped += 1;
                    continue;
                }
                for factor in registration_factors_for_pair(
                    i,
                    j,
                    &submaps,
                    &subsampled_submaps[j],
                    config,
                    stream_pool,
                ) {
                    graph.add(factor);
                }
            }
            Ok(other) => {
                warn!("unsupported matching cost factor type ({other})");
            }
            Err(e) => {
                warn!("{e}");
            }
        }
    }
    if dropped > 0 {
        warn!("removed {dropped} invalid factors");
        needs_recover = true;
    }

    Ok(LoadedState {
        submaps,
        subsampled_submaps,
        graph,
        values,
        needs_recover,
    })
}

/// Repair a graph whose values or edges went missing.
///
/// Scans the factor list for connectivity, re-anchors `X(0)` when its
/// damping factor is absent, restores missing pose values from the submap
/// index, re-links broken odometry chains from origin-odometry deltas, and
/// rebuilds absent IMU endpoint variables and edges with the same
/// precisions used at insert time.
pub(crate) fn recover_graph(
    graph: &FactorGraph,
    values: &Values,
    submaps: &[Submap],
    config: &GlobalMappingConfig,
) -> (FactorGraph, Values) {
    info!("recovering graph");

    let mut enable_imu = values
        .keys()
        .any(|k| matches!(k, Key::E(_) | Key::V(_) | Key::B(_)));
    enable_imu |= graph
        .iter()
        .any(|f| matches!(f, Factor::ImuChain(_)));
    info!(enable_imu, "recovery mode");

    info!("creating connectivity map");
    let connectivity = graph.connectivity_map();
    let connected = |a: Key, b: Key| -> bool {
        connectivity.get(&a).map(|s| s.contains(&b)).unwrap_or(false)
    };

    let prior_exists = graph.iter().any(|f| {
        matches!(f, Factor::LinearDamping(d) if d.key == Key::X(0))
    });

    let prior_noise3 = NoiseModel::isotropic(3, 1e6);
    let prior_noise6 = NoiseModel::isotropic(6, 1e6);

    let mut new_factors = FactorGraph::new();
    let mut new_values = Values::new();

    if !prior_exists {
        warn!("X0 prior is missing");
        new_factors.add(Factor::linear_damping(
            Key::X(0),
            6,
            config.init_pose_damping_scale,
        ));
    }

    info!("fixing missing values and factors");
    for (i, submap) in submaps.iter().enumerate() {
        let x_i = Key::X(i as u64);
        if !values.exists(&x_i) {
            warn!("X{i} is missing");
            new_values.insert_pose(x_i, submap.t_world_origin);
        }

        if i + 1 < submaps.len() && !connected(x_i, Key::X(i as u64 + 1)) {
            warn!("X{} -> X{} is missing", i, i + 1);
            let delta = submap
                .origin_odom_frame()
                .t_world_sensor
                .delta_to(&submaps[i + 1].origin_odom_frame().t_world_sensor);
            new_factors.add(Factor::pose_between(
                x_i,
                Key::X(i as u64 + 1),
                delta,
                prior_noise6.clone(),
            ));
        }

        if !enable_imu {
            continue;
        }

        let Some(first_frame) = submap.optim_odom_frames.first() else {
            continue;
        };
        let Some(last_frame) = submap.optim_odom_frames.last() else {
            continue;
        };

        let rotation_inv = submap.t_world_origin.rotation().inverse();
        let v_origin_l = rotation_inv * first_frame.v_world_imu;
        let v_origin_r = rotation_inv * last_frame.v_world_imu;

        let left = 2 * i as u64;
        let right = 2 * i as u64 + 1;

        if i != 0 {
            if !values.exists(&Key::E(left)) {
                warn!("E{left} is missing");
                new_values.insert_pose(
                    Key::E(left),
                    submap.t_world_origin.compose(&submap.t_origin_endpoint_l),
                );
            }
            if !values.exists(&Key::V(left)) {
                warn!("V{left} is missing");
                new_values.insert_velocity(Key::V(left), first_frame.v_world_imu);
            }
            if !values.exists(&Key::B(left)) {
                warn!("B{left} is missing");
                new_values.insert_bias(Key::B(left), first_frame.imu_bias);
            }

            if !connected(x_i, Key::E(left)) {
                warn!("X{i} -> E{left} is missing");
                new_factors.add(Factor::pose_between(
                    x_i,
                    Key::E(left),
                    submap.t_origin_endpoint_l,
                    prior_noise6.clone(),
                ));
            }
            if !connected(x_i, Key::V(left)) {
                warn!("X{i} -> V{left} is missing");
                new_factors.add(Factor::rotate_vector(
                    x_i,
                    Key::V(left),
                    v_origin_l,
                    prior_noise3.clone(),
                ));
            }
            if !connected(Key::B(left), Key::B(left)) {
                warn!("B{left} prior is missing");
                new_factors.add(Factor::bias_prior(
                    Key::B(left),
                    first_frame.imu_bias,
                    prior_noise6.clone(),
                ));
            }
            if !connected(Key::B(left), Key::B(right)) {
                warn!("B{left} -> B{right} is missing");
                new_factors.add(Factor::bias_between(
                    Key::B(left),
                    Key::B(right),
                    crate::imu::ImuBias::zero(),
                    prior_noise6.clone(),
                ));
            }
        }

        if !values.exists(&Key::E(right)) {
            warn!("E{right} is missing");
            new_values.insert_pose(
                Key::E(right),
                submap.t_world_origin.compose(&submap.t_origin_endpoint_r),
            );
        }
        if !values.exists(&Key::V(right)) {
            warn!("V{right} is missing");
            new_values.insert_velocity(Key::V(right), last_frame.v_world_imu);
        }
        if !values.exists(&Key::B(right)) {
            warn!("B{right} is missing");
            new_values.insert_bias(Key::B(right), last_frame.imu_bias);
        }

        if !connected(x_i, Key::E(right)) {
            warn!("X{i} -> E{right} is missing");
            new_factors.add(Factor::pose_between(
                x_i,
                Key::E(right),
                submap.t_origin_endpoint_r,
                prior_noise6.clone(),
            ));
        }
        if !connected(x_i, Key::V(right)) {
            warn!("X{i} -> V{right} is missing");
            new_factors.add(Factor::rotate_vector(
                x_i,
                Key::V(right),
                v_origin_r,
                prior_noise3.clone(),
            ));
        }
        if !connected(Key::B(right), Key::B(right)) {
            warn!("B{right} prior is missing");
            new_factors.add(Factor::bias_prior(
                Key::B(right),
                last_frame.imu_bias,
                prior_noise6.clone(),
            ));
        }
    }

    info!("recovering done");
    (new_factors, new_values)
}
