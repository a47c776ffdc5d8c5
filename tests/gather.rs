use std::sync::Arc;
use std::thread;

use mpi_runtime::collective::{self, GatherArgs, GatherRoot};
use mpi_runtime::config::{CollectiveFallback, Config, InterAlgorithm, IntraAlgorithm};
use mpi_runtime::request::{wait_all, Backend};
use mpi_runtime::schedule::Step;
use mpi_runtime::traits::*;
use mpi_runtime::{Error, Universe};

fn run<F>(size: u32, config: Config, f: F)
where
    F: Fn(Universe) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = Universe::local_world(size, config)
        .unwrap()
        .into_iter()
        .map(|universe| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(universe))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

fn recv_steps(steps: &[Step]) -> Vec<(usize, usize)> {
    steps
        .iter()
        .filter_map(|s| match s {
            Step::Recv { src, region, .. } => Some((*src, region.len)),
            _ => None,
        })
        .collect()
}

#[test]
fn gather_to_rank_zero() {
    run(8, Config::default(), |universe| {
        let world = universe.world();
        let rank = world.rank();
        let root = world.process_at_rank(0);
        let mine = [rank];
        if rank == 0 {
            let mut all = [-1i32; 8];
            root.gather_into_root(&mine[..], &mut all[..]).unwrap();
            assert_eq!(all, [0, 1, 2, 3, 4, 5, 6, 7]);
        } else {
            root.gather_into(&mine[..]).unwrap();
        }
    });
}

#[test]
fn gather_to_rotated_root() {
    run(6, Config::default(), |universe| {
        let world = universe.world();
        let rank = world.rank();
        let root = world.process_at_rank(3);
        let mine = [i64::from(rank) * 100, -i64::from(rank)];
        if rank == 3 {
            let mut all = vec![0i64; 12];
            root.gather_into_root(&mine[..], &mut all[..]).unwrap();
            let expected: Vec<i64> = (0..6).flat_map(|r| [r * 100, -r]).collect();
            assert_eq!(all, expected);
        } else {
            root.gather_into(&mine[..]).unwrap();
        }
    });
}

#[test]
fn tree_gather_in_place() {
    let mut config = Config::default();
    config.igather_intra_algorithm = IntraAlgorithm::GenericTree;
    config.igather_tree_kval = 4;
    run(9, config, |universe| {
        let world = universe.world();
        let rank = world.rank();
        let root = world.process_at_rank(2);
        if rank == 2 {
            let mut all = [0u32; 9];
            all[2] = 2;
            root.gather_in_place_root(&mut all[..]).unwrap();
            assert_eq!(all, [0, 1, 2, 3, 4, 5, 6, 7, 8]);
        } else {
            let mine = [rank as u32];
            let req = root.immediate_gather_into(&mine[..]).unwrap();
            assert_eq!(req.backend(), Backend::Tree);
            req.wait().unwrap();
        }
    });
}

#[test]
fn tree_arity_below_two_is_rejected() {
    let mut config = Config::default();
    config.igather_intra_algorithm = IntraAlgorithm::GenericTree;
    config.igather_tree_kval = 1;
    config.collective_fallback = CollectiveFallback::Error;
    let universes = Universe::local_world(2, config).unwrap();
    let world = universes[1].world();
    let mine = [1u8];
    let err = world.process_at_rank(0).immediate_gather_into(&mine[..]).unwrap_err();
    assert!(matches!(err, Error::NotApplicable { .. }));
}

/// World rank 0 forms one group, world ranks 1..5 the other.
fn inter_gather(config: Config, count: usize, check: fn(&[Step])) {
    run(5, config, move |universe| {
        let world = universe.world();
        let rank = world.rank();
        let inter = world
            .intercomm_create(&[0], &[1, 2, 3, 4])
            .unwrap()
            .expect("every rank is in a group");
        if rank == 0 {
            let mut all = vec![0u8; 4 * count];
            let req = inter.immediate_gather_as_root(&mut all[..]).unwrap();
            check(req.schedule().unwrap().steps());
            req.wait().unwrap();
            for (i, block) in all.chunks(count).enumerate() {
                assert!(block.iter().all(|&b| b == i as u8 + 1), "block {}", i);
            }
        } else {
            let mine = vec![rank as u8; count];
            inter.process_at_rank(0).gather_into(&mine[..]).unwrap();
        }
        inter.free().unwrap();
    });
}

#[test]
fn inter_gather_long_message() {
    let mut config = Config::default();
    config.gather_inter_short_msg_size = 256;
    inter_gather(config, 1000, |steps| {
        assert_eq!(recv_steps(steps), vec![(0, 4000)]);
    });
}

#[test]
fn inter_gather_short_message() {
    inter_gather(Config::default(), 8, |steps| {
        assert_eq!(recv_steps(steps), vec![(0, 8), (1, 8), (2, 8), (3, 8)]);
    });
}

#[test]
fn inter_gather_at_threshold_goes_long() {
    let mut config = Config::default();
    config.gather_inter_short_msg_size = 64;
    inter_gather(config, 16, |steps| {
        assert_eq!(recv_steps(steps), vec![(0, 64)]);
    });
}

#[test]
fn forced_inter_algorithm_wins_over_size() {
    let mut config = Config::default();
    config.igather_inter_algorithm = InterAlgorithm::SchedShort;
    config.gather_inter_short_msg_size = 1;
    inter_gather(config, 32, |steps| {
        assert_eq!(recv_steps(steps).len(), 4);
    });
}

#[test]
fn idle_members_of_root_group_complete_immediately() {
    let universes = Universe::local_world(3, Config::default()).unwrap();
    let worlds: Vec<_> = universes.iter().map(Universe::world).collect();
    let inters: Vec<_> = worlds
        .iter()
        .map(|w| w.intercomm_create(&[0, 1], &[2]).unwrap().unwrap())
        .collect();

    let idle = inters[1].immediate_gather_idle().unwrap();
    assert!(idle.is_complete());
    assert!(idle.schedule().unwrap().is_empty());
    idle.wait().unwrap();

    let mut all = [0u16; 3];
    let mine = [7u16, 8, 9];
    let root = inters[0].immediate_gather_as_root(&mut all[..]).unwrap();
    let sender = collective::igather(
        &inters[2],
        GatherArgs::contribute(GatherRoot::Rank(0), &mine[..]),
    )
    .unwrap();
    wait_all(vec![root, sender]).unwrap();
    assert_eq!(all, [7, 8, 9]);
}

#[test]
fn concurrent_gathers_on_separate_communicators() {
    let universes = Universe::local_world(4, Config::default()).unwrap();
    let worlds: Vec<_> = universes.iter().map(Universe::world).collect();
    let dups: Vec<_> = worlds.iter().map(|w| w.duplicate().unwrap()).collect();

    let sends: Vec<[u8; 1]> = (0..4u8).map(|r| [r]).collect();
    let mut on_world = [0u8; 4];
    let mut on_dup = [0u8; 4];
    let mut requests = Vec::new();
    requests.push(
        dups[0]
            .process_at_rank(0)
            .immediate_gather_into_root(&sends[0][..], &mut on_dup[..])
            .unwrap(),
    );
    requests.push(
        worlds[0]
            .process_at_rank(0)
            .immediate_gather_into_root(&sends[0][..], &mut on_world[..])
            .unwrap(),
    );
    for r in 1..4 {
        requests.push(worlds[r].process_at_rank(0).immediate_gather_into(&sends[r][..]).unwrap());
        requests.push(dups[r].process_at_rank(0).immediate_gather_into(&sends[r][..]).unwrap());
    }
    wait_all(requests).unwrap();
    assert_eq!(on_world, [0, 1, 2, 3]);
    assert_eq!(on_dup, [0, 1, 2, 3]);
}
