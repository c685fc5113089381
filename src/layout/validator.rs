use chrono::Utc;
use std::collections::HashSet;
use tracing::debug;

use super::errors::RejectionReason;
use super::generator::graph_distances;
use super::models::{CandidateLayout, Layout, LayoutId};

/// Checks candidate layouts and promotes the valid ones to [`Layout`]s
#[derive(Debug, Clone, Default)]
pub struct LayoutValidator;

impl LayoutValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, candidate: CandidateLayout) -> Result<Layout, RejectionReason> {
        let params = candidate.parameters;
        let rooms = &candidate.rooms;

        if rooms.is_empty() {
            return Err(RejectionReason::Empty);
        }

        if let Some(room) = rooms
            .iter()
            .find(|room| !room.bounds.fits_within(params.width, params.height))
        {
            return Err(RejectionReason::OutOfBounds { room_id: room.id });
        }

        let ids: HashSet<u32> = rooms.iter().map(|room| room.id).collect();
        let mut broken_edge = false;
        for room in rooms {
            for neighbour in &room.connections {
                let symmetric = rooms
                    .iter()
                    .find(|other| other.id == *neighbour)
                    .is_some_and(|other| other.connections.contains(&room.id));
                if !ids.contains(neighbour) || !symmetric || *neighbour == room.id {
                    broken_edge = true;
                }
            }
        }

        let reached = graph_distances(rooms, rooms[0].id);
        if broken_edge || reached.len() < rooms.len() {
            return Err(RejectionReason::Disconnected {
                unreachable: rooms.len() - reached.len(),
            });
        }

        for (i, a) in rooms.iter().enumerate() {
            if let Some(b) = rooms.iter().skip(i + 1).find(|b| a.bounds.overlaps(&b.bounds)) {
                return Err(RejectionReason::Overlapping {
                    first: a.id,
                    second: b.id,
                });
            }
        }

        if rooms.len() == 1 && params.room_count_target > 1 {
            return Err(RejectionReason::TooSparse {
                placed: 1,
                target: params.room_count_target,
            });
        }

        let (entry_room_id, exit_room_id) = farthest_pair(&candidate);
        let key = params.cache_key();

        debug!(
            cache_key = %key,
            salt = candidate.salt,
            rooms = rooms.len(),
            entry = entry_room_id,
            exit = exit_room_id,
            "Candidate layout accepted"
        );

        Ok(Layout {
            id: LayoutId::derive(key, candidate.salt),
            parameters: params,
            entry_room_id,
            exit_room_id,
            placement_shortfall: candidate.placement_shortfall,
            salt: candidate.salt,
            rooms: candidate.rooms,
            created_at: Utc::now(),
        })
    }
}

/// Pair of rooms with the greatest hop distance; ties go to the lowest ids
fn farthest_pair(candidate: &CandidateLayout) -> (u32, u32) {
    let mut ids: Vec<u32> = candidate.rooms.iter().map(|room| room.id).collect();
    ids.sort_unstable();

    let mut best = (ids[0], ids[0]);
    let mut best_distance = 0;

    for (i, from) in ids.iter().enumerate() {
        let distances = graph_distances(&candidate.rooms, *from);
        for to in ids.iter().skip(i + 1) {
            let distance = distances.get(to).copied().unwrap_or(0);
            if distance > best_distance {
                best_distance = distance;
                best = (*from, *to);
            }
        }
    }

    best
}
