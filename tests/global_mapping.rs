//! Integration tests for the global mapping backend.
//!
//! These tests drive the public API end-to-end: submap insertion, implicit
//! loop closure, IMU chains, persistence round-trips, and recovery from
//! corrupted state.

use apex_mapper::core::key::Key;
use apex_mapper::factors::Factor;
use apex_mapper::imu::GRAVITY;
use apex_mapper::pointcloud::PointCloud;
use apex_mapper::se3::SE3;
use apex_mapper::submap::{OdomFrame, Submap};
use apex_mapper::{BetweenRegistration, GlobalMapping, GlobalMappingConfig};

use nalgebra::Vector3;
use std::sync::Arc;

/// A small planar cloud: 6x6 columns at 0.1 m spacing, two z layers.
/// Its 0.5 m extent keeps consecutive submaps spaced 1 m apart disjoint.
fn small_cloud() -> Arc<PointCloud> {
    let mut points = Vec::new();
    for i in 0..6 {
        for j in 0..6 {
            for k in 0..2 {
                points.push(Vector3::new(
                    i as f64 * 0.1,
                    j as f64 * 0.1,
                    k as f64 * 0.1,
                ));
            }
        }
    }
    Arc::new(PointCloud::new(points))
}

/// An irregular cloud of `n` points in `[0, extent)^3` from a fixed LCG, so
/// registration residuals do not alias on the voxel lattice.
fn scattered_cloud(n: usize, extent: f64, seed: u64) -> Arc<PointCloud> {
    let mut state = seed.wrapping_mul(2685821657736338717).wrapping_add(1);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    let points = (0..n)
        .map(|_| Vector3::new(next() * extent, next() * extent, next() * extent))
        .collect();
    Arc::new(PointCloud::new(points))
}

/// Submap whose odometry frames place it at `odom` in the world.
fn submap_with_cloud(id: u64, odom: Vector3<f64>, stamp0: f64, cloud: Arc<PointCloud>) -> Submap {
    let pose = SE3::from_translation(odom);
    let frame_l = OdomFrame::new(stamp0, pose);
    let frame_r = OdomFrame::new(stamp0 + 1.0, pose);
    Submap {
        id,
        t_world_origin: pose,
        t_origin_endpoint_l: SE3::identity(),
        t_origin_endpoint_r: SE3::identity(),
        merged_keyframe: cloud,
        voxelmaps: Vec::new(),
        optim_odom_frames: vec![frame_l.clone(), frame_r.clone()],
        origin_odom_frames: vec![frame_l, frame_r],
    }
}

fn submap_at(id: u64, odom: Vector3<f64>, stamp0: f64) -> Submap {
    submap_with_cloud(id, odom, stamp0, small_cloud())
}

/// LiDAR-only configuration with single-level voxel maps and a strict
/// insert-time loop gate, so loop factors arrive through the overlap search
/// rather than at insertion.
fn test_config() -> GlobalMappingConfig {
    GlobalMappingConfig {
        enable_imu: false,
        enable_between_factors: false,
        submap_voxel_resolution: 0.25,
        submap_voxel_resolution_max: 0.25,
        submap_voxelmap_levels: 1,
        min_implicit_loop_overlap: 0.99,
        ..Default::default()
    }
}

fn count_matching<F: Fn(&Factor) -> bool>(mapping: &GlobalMapping, pred: F) -> usize {
    mapping.factors().iter().filter(|f| pred(f)).count()
}

#[test]
fn test_three_submap_chain_structure() {
    let mut mapping = GlobalMapping::new(test_config());
    for i in 0..3 {
        mapping
            .insert_submap(submap_at(i, Vector3::new(i as f64, 0.0, 0.0), i as f64 * 2.0))
            .unwrap();
    }

    // Three pose variables exist
    for i in 0..3 {
        assert!(
            mapping.estimate().pose(&Key::X(i)).is_some(),
            "missing pose x{i}"
        );
    }

    // Disjoint clouds: one damping anchor plus two isolation fallbacks
    assert_eq!(mapping.factors().len(), 3);
    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::LinearDamping(_))),
        1
    );
    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::PoseBetween(_))),
        2
    );

    // Chain holds the odometry spacing
    let x2 = mapping.estimate().pose(&Key::X(2)).unwrap();
    approx::assert_relative_eq!(x2.translation().x, 2.0, epsilon = 1e-6);
}

#[test]
fn test_revisit_closes_loop_and_shrinks_drift() {
    let mut mapping = GlobalMapping::new(test_config());
    let cloud = scattered_cloud(150, 1.0, 42);
    for i in 0..3 {
        mapping
            .insert_submap(submap_with_cloud(
                i,
                Vector3::new(i as f64 * 1.5, 0.0, 0.0),
                i as f64 * 2.0,
                Arc::clone(&cloud),
            ))
            .unwrap();
    }

    // Fourth submap revisits the origin but its odometry drifted 0.1 m
    mapping
        .insert_submap(submap_with_cloud(
            3,
            Vector3::new(0.1, 0.0, 0.0),
            6.0,
            Arc::clone(&cloud),
        ))
        .unwrap();

    // The strict insert gate rejected the (0, 3) pair
    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::Vgicp(_))),
        0
    );
    let drift_before = mapping.estimate().pose(&Key::X(3)).unwrap().translation().norm();

    mapping.find_overlapping_submaps(0.1).unwrap();

    // The overlap search linked the revisit pair with registration factors
    let loop_factors = count_matching(&mapping, |f| {
        if let Factor::Vgicp(v) = f {
            v.key1 == Key::X(0) && v.key2 == Key::X(3)
        } else {
            false
        }
    });
    assert!(loop_factors >= 1, "no x0-x3 registration factor added");

    let drift_after = mapping.estimate().pose(&Key::X(3)).unwrap().translation().norm();
    assert!(
        drift_after < drift_before - 1e-3,
        "loop closure did not shrink drift: before={drift_before}, after={drift_after}"
    );
}

#[test]
fn test_save_load_roundtrip_preserves_poses() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut mapping = GlobalMapping::new(test_config());
    let cloud = scattered_cloud(150, 1.0, 42);
    for i in 0..3 {
        mapping
            .insert_submap(submap_with_cloud(
                i,
                Vector3::new(i as f64 * 1.5, 0.0, 0.0),
                i as f64 * 2.0,
                Arc::clone(&cloud),
            ))
            .unwrap();
    }
    // A revisit adds registration factors so their descriptors round-trip too
    mapping
        .insert_submap(submap_with_cloud(
            3,
            Vector3::new(0.1, 0.0, 0.0),
            6.0,
            Arc::clone(&cloud),
        ))
        .unwrap();
    mapping.find_overlapping_submaps(0.1).unwrap();

    mapping.save(dir.path()).unwrap();
    let saved_poses: Vec<SE3> = (0..4)
        .map(|i| mapping.estimate().pose(&Key::X(i)).unwrap())
        .collect();

    let mut reloaded = GlobalMapping::new(test_config());
    reloaded.load(dir.path()).unwrap();

    assert_eq!(reloaded.num_submaps(), 4);
    assert!(count_matching(&reloaded, |f| matches!(f, Factor::Vgicp(_))) >= 1);
    for (i, saved) in saved_poses.iter().enumerate() {
        let pose = reloaded.estimate().pose(&Key::X(i as u64)).unwrap();
        let diff = saved.delta_to(&pose).log().norm();
        assert!(diff < 1e-3, "pose x{i} moved {diff} across the round trip");
    }
}

#[test]
fn test_corrupt_values_recovers_on_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut mapping = GlobalMapping::new(test_config());
    for i in 0..3 {
        mapping
            .insert_submap(submap_at(i, Vector3::new(i as f64, 0.0, 0.0), i as f64 * 2.0))
            .unwrap();
    }
    mapping.save(dir.path()).unwrap();

    std::fs::write(dir.path().join("values.bin"), b"not a values dump").unwrap();

    let mut reloaded = GlobalMapping::new(test_config());
    reloaded.load(dir.path()).unwrap();

    assert_eq!(reloaded.num_submaps(), 3);
    for i in 0..3 {
        assert!(
            reloaded.estimate().pose(&Key::X(i)).is_some(),
            "x{i} missing after recovery"
        );
    }
}

#[test]
fn test_optimize_is_idempotent() {
    let mut mapping = GlobalMapping::new(test_config());
    for i in 0..3 {
        mapping
            .insert_submap(submap_at(i, Vector3::new(i as f64, 0.0, 0.0), i as f64 * 2.0))
            .unwrap();
    }

    let before: Vec<SE3> = (0..3)
        .map(|i| mapping.estimate().pose(&Key::X(i)).unwrap())
        .collect();

    for _ in 0..3 {
        mapping.optimize().unwrap();
    }

    for (i, pose_before) in before.iter().enumerate() {
        let pose_after = mapping.estimate().pose(&Key::X(i as u64)).unwrap();
        let moved = pose_before.delta_to(&pose_after).log().norm();
        assert!(moved < 1e-8, "x{i} moved {moved} across idle optimizes");
    }
}

#[test]
fn test_empty_backend_is_well_behaved() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut mapping = GlobalMapping::new(test_config());

    mapping.find_overlapping_submaps(0.1).unwrap();
    mapping.optimize().unwrap();
    assert!(mapping.export_points().is_empty());

    // Saving an empty backend writes an empty graph
    mapping.save(dir.path()).unwrap();
    let header = std::fs::read_to_string(dir.path().join("graph.txt")).unwrap();
    assert!(header.starts_with("num_submaps: 0"));
}

#[test]
fn test_identical_submaps_with_between_factors() {
    let config = GlobalMappingConfig {
        enable_imu: false,
        enable_between_factors: true,
        between_registration_type: BetweenRegistration::Gicp,
        submap_voxel_resolution: 0.1,
        submap_voxel_resolution_max: 0.1,
        submap_voxelmap_levels: 1,
        ..Default::default()
    };
    let mut mapping = GlobalMapping::new(config);

    mapping
        .insert_submap(submap_at(0, Vector3::zeros(), 0.0))
        .unwrap();
    mapping
        .insert_submap(submap_at(1, Vector3::zeros(), 2.0))
        .unwrap();

    // A coincident second submap yields a between-factor and, with full
    // overlap, at least one matching-cost factor.
    assert!(count_matching(&mapping, |f| matches!(f, Factor::PoseBetween(_))) >= 1);
    assert!(count_matching(&mapping, |f| matches!(f, Factor::Vgicp(_))) >= 1);
}

#[test]
fn test_imu_chain_invariants() {
    let config = GlobalMappingConfig {
        enable_imu: true,
        enable_between_factors: false,
        submap_voxel_resolution: 0.1,
        submap_voxel_resolution_max: 0.1,
        submap_voxelmap_levels: 1,
        ..Default::default()
    };
    let mut mapping = GlobalMapping::new(config);

    for i in 0..600 {
        mapping.insert_imu(
            i as f64 * 0.01,
            Vector3::new(0.0, 0.0, GRAVITY),
            Vector3::zeros(),
        );
    }

    for i in 0..3 {
        mapping
            .insert_submap(submap_at(i, Vector3::new(i as f64 * 0.1, 0.0, 0.0), i as f64 * 2.0))
            .unwrap();
    }

    let estimate = mapping.estimate();
    // The left endpoint of the first submap is never created
    assert!(!estimate.exists(&Key::E(0)));
    assert!(!estimate.exists(&Key::V(0)));
    assert!(!estimate.exists(&Key::B(0)));

    // Every other endpoint variable exists
    for k in 1..3u64 {
        for idx in [2 * k, 2 * k + 1] {
            assert!(estimate.exists(&Key::E(idx)), "e{idx} missing");
            assert!(estimate.exists(&Key::V(idx)), "v{idx} missing");
            assert!(estimate.exists(&Key::B(idx)), "b{idx} missing");
        }
    }
    assert!(estimate.exists(&Key::E(1)));

    // Chains between consecutive submaps are IMU factors, not fallbacks
    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::ImuChain(_))),
        2
    );
}

#[test]
fn test_sparse_imu_uses_zero_velocity_fallback() {
    let config = GlobalMappingConfig {
        enable_imu: true,
        enable_between_factors: false,
        submap_voxel_resolution: 0.1,
        submap_voxel_resolution_max: 0.1,
        submap_voxelmap_levels: 1,
        ..Default::default()
    };
    let mut mapping = GlobalMapping::new(config);

    // One lone sample between the submap boundary stamps
    mapping.insert_imu(1.5, Vector3::new(0.0, 0.0, GRAVITY), Vector3::zeros());

    mapping
        .insert_submap(submap_at(0, Vector3::zeros(), 0.0))
        .unwrap();
    mapping
        .insert_submap(submap_at(1, Vector3::new(0.1, 0.0, 0.0), 2.0))
        .unwrap();

    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::VelocityBetween(_))),
        1
    );
    assert_eq!(
        count_matching(&mapping, |f| matches!(f, Factor::ImuChain(_))),
        0
    );
}
