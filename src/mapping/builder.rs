//! Construction of the constraint sets staged when a submap arrives.
//!
//! Three factor families are built here: sequential between-factors
//! (optionally refined by a local GICP alignment), implicit-loop matching
//! cost factors gated by distance and voxel-map overlap, and the
//! voxel-map/subsampled-cloud preparation both the insert and reload paths
//! share.

use nalgebra::Matrix6;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::values::Values;
use crate::factors::registration::{GicpFactor, StreamBufferRoundRobin, VgicpFactor};
use crate::factors::{Factor, NoiseModel};
use crate::mapping::config::{BetweenRegistration, GlobalMappingConfig};
use crate::pointcloud::voxelmap::build_multilevel;
use crate::pointcloud::{median_distance, random_sampling, PointCloud};
use crate::smoother::{IncrementalSmoother, Smoother, SmootherSettings};
use crate::submap::Submap;

/// Points sampled when estimating the median scan range.
const MEDIAN_SCAN_COUNT: usize = 256;

/// Build the multi-resolution voxel maps for a submap at the adaptively
/// chosen base resolution and derive its subsampled cloud.
pub(crate) fn prepare_submap(
    submap: &mut Submap,
    config: &GlobalMappingConfig,
    rng: &mut StdRng,
) -> Arc<PointCloud> {
    let dist_median = median_distance(&submap.merged_keyframe, MEDIAN_SCAN_COUNT);
    let base_resolution = config.base_resolution_for(dist_median);

    let subsampled = random_sampling(&submap.merged_keyframe, config.randomsampling_rate, rng);

    submap.voxelmaps = build_multilevel(
        &subsampled,
        base_resolution,
        config.submap_voxelmap_levels,
        config.submap_voxelmap_scaling_factor,
    );

    debug!(
        id = submap.id,
        dist_median,
        base_resolution,
        levels = submap.voxelmaps.len(),
        "built submap voxelmaps"
    );

    subsampled
}

/// Between-factor set for submap `current`.
///
/// Empty for the first submap or when between-factors are disabled. With
/// registration disabled the odometry delta is trusted at tight isotropic
/// precision; otherwise a two-variable local alignment refines the delta and
/// its information matrix is taken from the registration Hessian.
pub(crate) fn create_between_factors(
    submaps: &[Submap],
    config: &GlobalMappingConfig,
    current: usize,
) -> FactorGraph {
    let mut factors = FactorGraph::new();
    if current == 0 || !config.enable_between_factors {
        return factors;
    }

    let last = current - 1;
    let init_delta = submaps[last]
        .t_world_origin
        .delta_to(&submaps[current].t_world_origin);

    if config.between_registration_type == BetweenRegistration::None {
        factors.add(Factor::pose_between(
            Key::X(last as u64),
            Key::X(current as u64),
            init_delta,
            NoiseModel::isotropic(6, 1e6),
        ));
        return factors;
    }

    // Local two-variable problem: prior on the first pose, registration
    // between the two keyframes.
    let mut values = Values::new();
    values.insert_pose(Key::X(0), crate::se3::SE3::identity());
    values.insert_pose(Key::X(1), init_delta);

    let gicp = GicpFactor::new(
        Key::X(0),
        Key::X(1),
        Arc::clone(&submaps[last].merged_keyframe),
        Arc::clone(&submaps[current].merged_keyframe),
    )
    .set_max_correspondence_distance(0.5)
    .set_num_threads(2);

    let mut graph = FactorGraph::new();
    graph.add(Factor::pose_prior(
        Key::X(0),
        crate::se3::SE3::identity(),
        NoiseModel::isotropic(6, 1e6),
    ));
    graph.add(Factor::Gicp(gicp.clone()));

    debug!("--- local registration refinement ---");
    let mut local = IncrementalSmoother::new(SmootherSettings {
        max_iterations: 10,
        initial_lambda: 1e-12,
        ..SmootherSettings::default()
    });

    let refined = local
        .update(graph, values)
        .and_then(|_| {
            let estimate = local.calculate_estimate();
            let delta = estimate
                .pose(&Key::X(1))
                .ok_or(crate::smoother::SmootherError::Factor(
                    crate::factors::FactorError::MissingValue(Key::X(1)),
                ))?;
            let hessian = gicp.hessian_block_second(estimate)?;
            Ok((delta, hessian))
        });

    match refined {
        Ok((estimated_delta, hessian)) => {
            let info = hessian + Matrix6::identity() * 1e6;
            factors.add(Factor::pose_between(
                Key::X(last as u64),
                Key::X(current as u64),
                estimated_delta,
                NoiseModel::information(info),
            ));
        }
        Err(e) => {
            warn!("local registration refinement failed ({e}); keeping odometry delta");
            factors.add(Factor::pose_between(
                Key::X(last as u64),
                Key::X(current as u64),
                init_delta,
                NoiseModel::isotropic(6, 1e6),
            ));
        }
    }

    factors
}

/// One registration factor per voxel-map level of submap `i` against the
/// subsampled cloud of submap `j`.
pub(crate) fn registration_factors_for_pair(
    i: usize,
    j: usize,
    submaps: &[Submap],
    subsampled: &Arc<PointCloud>,
    config: &GlobalMappingConfig,
    stream_pool: &StreamBufferRoundRobin,
) -> Vec<Factor> {
    submaps[i]
        .voxelmaps
        .iter()
        .map(|voxelmap| {
            let factor = if config.registration_error_factor_type.is_gpu() {
                VgicpFactor::new_gpu(
                    Key::X(i as u64),
                    Key::X(j as u64),
                    Arc::clone(voxelmap),
                    Arc::clone(subsampled),
                    stream_pool.get_stream_buffer(),
                )
            } else {
                VgicpFactor::new(
                    Key::X(i as u64),
                    Key::X(j as u64),
                    Arc::clone(voxelmap),
                    Arc::clone(subsampled),
                )
            };
            Factor::Vgicp(factor)
        })
        .collect()
}

/// Matching-cost factor set for submap `current`: implicit-loop candidates
/// gated by distance and overlap, plus the isolation fallback when even the
/// previous submap barely overlaps.
pub(crate) fn create_matching_cost_factors(
    submaps: &[Submap],
    subsampled_submaps: &[Arc<PointCloud>],
    config: &GlobalMappingConfig,
    current: usize,
    stream_pool: &StreamBufferRoundRobin,
) -> FactorGraph {
    let mut factors = FactorGraph::new();
    if current == 0 {
        return factors;
    }

    let current_submap = &submaps[current];
    let mut previous_overlap = 0.0;

    for i in 0..current {
        let dist = (submaps[i].t_world_origin.translation()
            - current_submap.t_world_origin.translation())
        .norm();
        if dist > config.max_implicit_loop_distance {
            continue;
        }

        let delta = submaps[i]
            .t_world_origin
            .delta_to(&current_submap.t_world_origin);
        // Gate on the full keyframe; the factors themselves take the
        // subsampled cloud.
        let overlap = match submaps[i].voxelmaps.last() {
            Some(coarsest) => coarsest.overlap(&current_submap.merged_keyframe, &delta),
            None => 0.0,
        };

        if i == current - 1 {
            previous_overlap = overlap;
        }
        if overlap < config.min_implicit_loop_overlap {
            continue;
        }

        factors.extend(
            registration_factors_for_pair(
                i,
                current,
                submaps,
                &subsampled_submaps[current],
                config,
                stream_pool,
            )
            .into_iter()
            .collect(),
        );
    }

    if previous_overlap < config.min_implicit_loop_overlap.max(0.25) {
        warn!(
            previous_overlap,
            "previous submap has only a small overlap with the current submap"
        );
        warn!("create a between factor to prevent the submap from being isolated");
        let last = current - 1;
        let init_delta = submaps[last]
            .t_world_origin
            .delta_to(&current_submap.t_world_origin);
        factors.add(Factor::pose_between(
            Key::X(last as u64),
            Key::X(current as u64),
            init_delta,
            NoiseModel::isotropic(6, 1e6),
        ));
    }

    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se3::SE3;
    use nalgebra::Vector3;
    use rand::SeedableRng;

    fn dense_submap(id: u64, x: f64) -> Submap {
        let mut points = Vec::new();
        for i in 0..15 {
            for j in 0..15 {
                points.push(Vector3::new(i as f64 * 0.2, j as f64 * 0.2, 0.0));
            }
        }
        Submap {
            id,
            t_world_origin: SE3::from_translation(Vector3::new(x, 0.0, 0.0)),
            t_origin_endpoint_l: SE3::identity(),
            t_origin_endpoint_r: SE3::identity(),
            merged_keyframe: Arc::new(PointCloud::new(points)),
            voxelmaps: Vec::new(),
            optim_odom_frames: vec![crate::submap::OdomFrame::new(0.0, SE3::identity())],
            origin_odom_frames: vec![crate::submap::OdomFrame::new(0.0, SE3::identity())],
        }
    }

    fn prepared(submaps: &mut [Submap]) -> Vec<Arc<PointCloud>> {
        let config = GlobalMappingConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        submaps
            .iter_mut()
            .map(|s| prepare_submap(s, &config, &mut rng))
            .collect()
    }

    #[test]
    fn test_prepare_builds_configured_levels() {
        let mut submap = dense_submap(0, 0.0);
        let config = GlobalMappingConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let subsampled = prepare_submap(&mut submap, &config, &mut rng);
        assert_eq!(submap.voxelmaps.len(), config.submap_voxelmap_levels);
        // Identity subsampling at the default rate
        assert!(Arc::ptr_eq(&subsampled, &submap.merged_keyframe));
    }

    #[test]
    fn test_between_factors_empty_for_first_submap() {
        let submaps = vec![dense_submap(0, 0.0)];
        let config = GlobalMappingConfig {
            enable_between_factors: true,
            ..Default::default()
        };
        assert!(create_between_factors(&submaps, &config, 0).is_empty());
    }

    #[test]
    fn test_between_factors_none_registration() {
        let submaps = vec![dense_submap(0, 0.0), dense_submap(1, 1.0)];
        let config = GlobalMappingConfig {
            enable_between_factors: true,
            between_registration_type: BetweenRegistration::None,
            ..Default::default()
        };
        let factors = create_between_factors(&submaps, &config, 1);
        assert_eq!(factors.len(), 1);
    }

    #[test]
    fn test_between_factors_gicp_refinement() {
        let submaps = vec![dense_submap(0, 0.0), dense_submap(1, 0.1)];
        let config = GlobalMappingConfig {
            enable_between_factors: true,
            ..Default::default()
        };
        let factors = create_between_factors(&submaps, &config, 1);
        assert_eq!(factors.len(), 1);
        match &factors.factors()[0] {
            Factor::PoseBetween(f) => {
                assert!(matches!(f.noise, NoiseModel::Information(_)));
            }
            other => panic!("unexpected factor: {other:?}"),
        }
    }

    #[test]
    fn test_matching_cost_overlapping_pair_gets_per_level_factors() {
        let mut submaps = vec![dense_submap(0, 0.0), dense_submap(1, 0.0)];
        let subsampled = prepared(&mut submaps);
        let config = GlobalMappingConfig::default();
        let pool = StreamBufferRoundRobin::default();

        let factors = create_matching_cost_factors(&submaps, &subsampled, &config, 1, &pool);
        // Full overlap: one VGICP per level, no isolation fallback
        assert_eq!(factors.len(), config.submap_voxelmap_levels);
        assert!(factors.iter().all(|f| matches!(f, Factor::Vgicp(_))));
    }

    #[test]
    fn test_matching_cost_isolation_fallback() {
        let mut submaps = vec![dense_submap(0, 0.0), dense_submap(1, 50.0)];
        let subsampled = prepared(&mut submaps);
        let config = GlobalMappingConfig::default();
        let pool = StreamBufferRoundRobin::default();

        let factors = create_matching_cost_factors(&submaps, &subsampled, &config, 1, &pool);
        // Disjoint clouds: no registration factors, only the fallback between
        assert_eq!(factors.len(), 1);
        assert!(matches!(factors.factors()[0], Factor::PoseBetween(_)));
    }

    #[test]
    fn test_gpu_kind_factors_hold_stream_slots() {
        let mut submaps = vec![dense_submap(0, 0.0), dense_submap(1, 0.0)];
        let subsampled = prepared(&mut submaps);
        let config = GlobalMappingConfig {
            registration_error_factor_type: crate::mapping::config::RegistrationErrorKind::VgicpGpu,
            ..Default::default()
        };
        let pool = StreamBufferRoundRobin::default();

        let factors = create_matching_cost_factors(&submaps, &subsampled, &config, 1, &pool);
        for factor in factors.iter() {
            match factor {
                Factor::Vgicp(f) => assert!(f.gpu),
                other => panic!("unexpected factor: {other:?}"),
            }
        }
    }
}
