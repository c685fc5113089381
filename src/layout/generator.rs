//! Seeded room-and-connection generator.
//!
//! Rooms are scattered as non-overlapping rectangles, then joined with a
//! randomized minimum spanning tree over room-center distances and a few
//! extra short edges to form loops. Everything is driven by a `StdRng`
//! seeded from the parameters, so the same inputs always yield the same
//! candidate.

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::models::{CandidateLayout, GenerationParameters, Layout, Rect, Room, RoomKind};
use crate::config::DifficultyPreset;

/// Margin kept free around each room so neighbours never share a wall
const ROOM_MARGIN: u32 = 1;

/// Upper bound on the jitter applied to spanning-tree edge weights
const EDGE_JITTER: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct LayoutGenerator {
    placement_attempts_per_room: u32,
}

impl Default for LayoutGenerator {
    fn default() -> Self {
        Self::new(30)
    }
}

impl LayoutGenerator {
    pub fn new(placement_attempts_per_room: u32) -> Self {
        Self {
            placement_attempts_per_room: placement_attempts_per_room.max(1),
        }
    }

    /// Produces an unvalidated candidate for the given parameters and salt
    pub fn generate(
        &self,
        params: &GenerationParameters,
        preset: &DifficultyPreset,
        salt: u32,
    ) -> CandidateLayout {
        let mut rng = StdRng::seed_from_u64(mix_seed(params.seed, salt, 0));
        let mut rooms = self.place_rooms(params, preset, &mut rng);
        connect_rooms(&mut rooms, preset.loop_fraction, &mut rng);

        let placement_shortfall = params
            .room_count_target
            .saturating_sub(rooms.len() as u32);

        CandidateLayout {
            parameters: *params,
            salt,
            rooms,
            placement_shortfall,
        }
    }

    fn place_rooms(
        &self,
        params: &GenerationParameters,
        preset: &DifficultyPreset,
        rng: &mut StdRng,
    ) -> Vec<Room> {
        let target = params.room_count_target as usize;
        let budget = u64::from(params.room_count_target)
            * u64::from(self.placement_attempts_per_room);

        let (min_w, max_w) = size_range(preset, params.width);
        let (min_h, max_h) = size_range(preset, params.height);

        let mut rooms: Vec<Room> = Vec::with_capacity(target);
        let mut attempts = 0u64;

        while rooms.len() < target && attempts < budget {
            attempts += 1;

            let width = rng.random_range(min_w..=max_w);
            let height = rng.random_range(min_h..=max_h);
            let x = rng.random_range(0..=params.width - width);
            let y = rng.random_range(0..=params.height - height);
            let bounds = Rect::new(x, y, width, height);

            if rooms
                .iter()
                .any(|room| room.bounds.overlaps_with_margin(&bounds, ROOM_MARGIN))
            {
                continue;
            }

            rooms.push(Room::new(rooms.len() as u32, bounds));
        }

        rooms
    }
}

/// Clamps the preset's room size range to the available extent
fn size_range(preset: &DifficultyPreset, extent: u32) -> (u32, u32) {
    let max = preset.max_room_size.min(extent).max(1);
    let min = preset.min_room_size.min(max).max(1);
    (min, max)
}

/// Mixes seed, retry salt and a stream id into one RNG seed
fn mix_seed(seed: i64, salt: u32, stream: u64) -> u64 {
    let mut z = (seed as u64)
        ^ u64::from(salt).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ stream.wrapping_mul(0xd1b5_4a32_d192_ed03);
    // splitmix64 finalizer
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn link(rooms: &mut [Room], a: usize, b: usize) {
    let (id_a, id_b) = (rooms[a].id, rooms[b].id);
    rooms[a].connections.insert(id_b);
    rooms[b].connections.insert(id_a);
}

/// Randomized Prim's spanning tree plus `ceil(loop_fraction * n)` loop edges
fn connect_rooms(rooms: &mut [Room], loop_fraction: f64, rng: &mut StdRng) {
    let n = rooms.len();
    if n < 2 {
        return;
    }

    // Symmetric jitter, drawn in a fixed (i < j) order for determinism
    let mut jitter = vec![0.0f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let value = rng.random::<f64>() * EDGE_JITTER;
            jitter[i * n + j] = value;
            jitter[j * n + i] = value;
        }
    }
    let weight = |rooms: &[Room], i: usize, j: usize| {
        rooms[i].bounds.distance_squared(&rooms[j].bounds) as f64 * (1.0 + jitter[i * n + j])
    };

    let mut in_tree = vec![false; n];
    let mut best_cost = vec![f64::INFINITY; n];
    let mut best_from = vec![0usize; n];
    let mut tree_edges: BTreeSet<(usize, usize)> = BTreeSet::new();

    in_tree[0] = true;
    for j in 1..n {
        best_cost[j] = weight(rooms, 0, j);
    }

    for _ in 1..n {
        let mut next = None;
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            match next {
                Some(current) if best_cost[current] <= best_cost[j] => {}
                _ => next = Some(j),
            }
        }
        let Some(v) = next else { break };

        in_tree[v] = true;
        let u = best_from[v];
        link(rooms, u, v);
        tree_edges.insert((u.min(v), u.max(v)));

        for j in 0..n {
            if !in_tree[j] {
                let cost = weight(rooms, v, j);
                if cost < best_cost[j] {
                    best_cost[j] = cost;
                    best_from[j] = v;
                }
            }
        }
    }

    let extra = (loop_fraction * n as f64).ceil() as usize;
    if extra == 0 {
        return;
    }

    let mut candidates: Vec<(i64, usize, usize)> = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if !tree_edges.contains(&(i, j)) {
                candidates.push((rooms[i].bounds.distance_squared(&rooms[j].bounds), i, j));
            }
        }
    }
    candidates.sort_unstable();
    candidates.truncate(3 * n);
    candidates.shuffle(rng);

    for (_, i, j) in candidates.into_iter().take(extra) {
        link(rooms, i, j);
    }
}

/// Breadth-first hop counts from `start` over the room connection graph
pub(crate) fn graph_distances(rooms: &[Room], start: u32) -> HashMap<u32, usize> {
    let by_id: HashMap<u32, &Room> = rooms.iter().map(|room| (room.id, room)).collect();
    let mut distances = HashMap::with_capacity(rooms.len());
    if !by_id.contains_key(&start) {
        return distances;
    }

    let mut queue = VecDeque::from([start]);
    distances.insert(start, 0);

    while let Some(current) = queue.pop_front() {
        let depth = distances[&current];
        let Some(room) = by_id.get(&current) else {
            continue;
        };
        for neighbour in &room.connections {
            if by_id.contains_key(neighbour) && !distances.contains_key(neighbour) {
                distances.insert(*neighbour, depth + 1);
                queue.push_back(*neighbour);
            }
        }
    }

    distances
}

/// Assigns room kinds to a validated layout.
///
/// The entry becomes the Entrance and the exit the Boss room. Remaining rooms
/// roll for Trap (only beyond the nearest fifth of the dungeon's depth) and
/// then Treasure. Rolls come from a dedicated seeded stream.
pub fn furnish(layout: &mut Layout, preset: &DifficultyPreset) {
    let mut rng = StdRng::seed_from_u64(mix_seed(layout.parameters.seed, layout.salt, 1));
    let distances = graph_distances(&layout.rooms, layout.entry_room_id);
    let depth = distances.values().copied().max().unwrap_or(0);
    let safe_radius = depth / 5;

    for room in layout.rooms.iter_mut() {
        let trap_roll = rng.random::<f64>();
        let treasure_roll = rng.random::<f64>();

        room.kind = if room.id == layout.entry_room_id {
            RoomKind::Entrance
        } else if room.id == layout.exit_room_id {
            RoomKind::Boss
        } else if distances.get(&room.id).copied().unwrap_or(0) > safe_radius
            && trap_roll < preset.trap_chance
        {
            RoomKind::Trap
        } else if treasure_roll < preset.treasure_chance {
            RoomKind::Treasure
        } else {
            RoomKind::Normal
        };
    }
}
