// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};

#[derive(PartialEq, Clone, Copy, Debug, Default)]
pub enum PieceStatus {
    #[default]
    Need,
    Done,
}

/// Per-piece bookkeeping for one session.
///
/// A piece lives in exactly one of three places: `need_queue` (nobody is
/// fetching it), `pending_queue` (requested from the listed peers, possibly
/// being verified or written) or `bitfield` as `Done`.
#[derive(Default, Debug, Clone)]
pub struct PieceManager {
    pub bitfield: Vec<PieceStatus>,
    pub need_queue: Vec<u32>,
    pub pending_queue: HashMap<u32, Vec<String>>,
    pub piece_rarity: HashMap<u32, usize>,
    pub pieces_remaining: usize,
}

impl PieceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initial_fields(&mut self, num_pieces: usize, all_owned: bool) {
        self.need_queue.clear();
        self.pending_queue.clear();
        self.piece_rarity.clear();

        if all_owned {
            self.bitfield = vec![PieceStatus::Done; num_pieces];
        } else {
            self.bitfield = vec![PieceStatus::Need; num_pieces];
            self.need_queue.extend(0..num_pieces as u32);
        }
        self.pieces_remaining = self.need_queue.len();
    }

    pub fn piece_count(&self) -> usize {
        self.bitfield.len()
    }

    pub fn owned_count(&self) -> usize {
        self.bitfield.len() - self.pieces_remaining
    }

    pub fn is_owned(&self, piece_index: u32) -> bool {
        self.bitfield.get(piece_index as usize) == Some(&PieceStatus::Done)
    }

    pub fn is_complete(&self) -> bool {
        !self.bitfield.is_empty() && self.pieces_remaining == 0
    }

    pub fn owned_mask(&self) -> Vec<bool> {
        self.bitfield
            .iter()
            .map(|s| *s == PieceStatus::Done)
            .collect()
    }

    /// Marks a verified, stored piece as owned. Returns the peers that still
    /// had it pending.
    pub fn mark_as_complete(&mut self, piece_index: u32) -> Vec<String> {
        match self.bitfield.get(piece_index as usize) {
            None | Some(PieceStatus::Done) => return Vec::new(),
            Some(PieceStatus::Need) => {}
        }

        self.bitfield[piece_index as usize] = PieceStatus::Done;
        self.pieces_remaining = self.pieces_remaining.saturating_sub(1);
        self.need_queue.retain(|&p| p != piece_index);
        self.piece_rarity.remove(&piece_index);

        self.pending_queue.remove(&piece_index).unwrap_or_default()
    }

    /// Puts a piece back into the need queue, whether it was pending or had
    /// already been marked done.
    pub fn requeue_pending_to_need(&mut self, piece_index: u32) {
        let Some(status) = self.bitfield.get_mut(piece_index as usize) else {
            return;
        };
        self.pending_queue.remove(&piece_index);

        if *status == PieceStatus::Done {
            self.pieces_remaining += 1;
        }
        *status = PieceStatus::Need;

        if !self.need_queue.contains(&piece_index) {
            self.need_queue.push(piece_index);
        }
    }

    pub fn mark_as_pending(&mut self, piece_index: u32, peer_id: String) {
        self.need_queue.retain(|&p| p != piece_index);
        self.pending_queue
            .entry(piece_index)
            .or_default()
            .push(peer_id);
    }

    /// Drops `peer_id` from a pending piece; the piece returns to the need
    /// queue once no peer is left fetching it.
    pub fn release_pending(&mut self, piece_index: u32, peer_id: &str) {
        let Some(peers) = self.pending_queue.get_mut(&piece_index) else {
            return;
        };
        peers.retain(|p| p != peer_id);
        if peers.is_empty() {
            self.requeue_pending_to_need(piece_index);
        }
    }

    pub fn update_rarity<'a, I>(&mut self, all_peer_bitfields: I)
    where
        I: Iterator<Item = &'a Vec<bool>>,
    {
        self.piece_rarity.clear();
        for bitfield in all_peer_bitfields {
            for (index, has) in bitfield.iter().enumerate() {
                if *has && self.bitfield.get(index) == Some(&PieceStatus::Need) {
                    *self.piece_rarity.entry(index as u32).or_insert(0) += 1;
                }
            }
        }
    }

    /// Rarest needed piece the peer has, lowest index on ties.
    pub fn choose_piece_for_peer(
        &self,
        peer_bitfield: &[bool],
        peer_pending: &HashSet<u32>,
        excluded: &HashSet<u32>,
    ) -> Option<u32> {
        self.need_queue
            .iter()
            .filter(|&&p| peer_bitfield.get(p as usize) == Some(&true))
            .filter(|&&p| !peer_pending.contains(&p))
            .filter(|&&p| !excluded.contains(&p))
            .min_by_key(|&&p| (self.piece_rarity.get(&p).copied().unwrap_or(usize::MAX), p))
            .copied()
    }

    /// Whether any of the given bitfields holds a piece we still need.
    pub fn is_obtainable<'a, I>(&self, mut all_peer_bitfields: I) -> bool
    where
        I: Iterator<Item = &'a Vec<bool>>,
    {
        all_peer_bitfields.any(|bitfield| {
            self.need_queue
                .iter()
                .any(|&p| bitfield.get(p as usize) == Some(&true))
        })
    }

    pub fn get_piece_availability(&self, piece_index: u32) -> u32 {
        self.piece_rarity.get(&piece_index).copied().unwrap_or(0) as u32
    }
}
