//! Move sources for the automated opponent.

use clap::ValueEnum;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::{Board, CellState, BOARD_SIZE, FLEET_SIZE};
use std::collections::VecDeque;

/// Chooses where the opponent fires and how its fleet is laid out.
pub trait MoveSource: Send {
    /// Next cell to attack on `board`, never one that is already marked.
    /// `None` only when every cell is marked.
    fn next_target(&mut self, board: &Board) -> Option<(usize, usize)>;

    /// A board holding the opponent's fleet.
    fn place_fleet(&mut self) -> Board;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpponentKind {
    Random,
    Scripted,
}

impl OpponentKind {
    pub fn build(self, seed: Option<u64>) -> Box<dyn MoveSource> {
        match self {
            OpponentKind::Random => Box::new(RandomOpponent::new(seed)),
            OpponentKind::Scripted => Box::new(ScriptedMoves::row_major()),
        }
    }
}

fn all_cells() -> Vec<(usize, usize)> {
    (0..BOARD_SIZE)
        .flat_map(|row| (0..BOARD_SIZE).map(move |col| (row, col)))
        .collect()
}

fn fleet_board(cells: &[(usize, usize)]) -> Board {
    let mut board = Board::new();
    for &(row, col) in cells {
        // Cells come from `all_cells`, so they are always in bounds.
        let _ = board.set(row, col, CellState::Ship);
    }
    board
}

/// Fires at shuffled unmarked cells, refilling its pool when it runs dry.
pub struct RandomOpponent {
    rng: StdRng,
    pool: Vec<(usize, usize)>,
}

impl RandomOpponent {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            pool: Vec::new(),
        }
    }

    fn refill(&mut self, board: &Board) {
        self.pool = board.unmarked_cells();
        self.pool.shuffle(&mut self.rng);
        debug!("Opponent move pool refilled with {} cells", self.pool.len());
    }
}

impl MoveSource for RandomOpponent {
    fn next_target(&mut self, board: &Board) -> Option<(usize, usize)> {
        loop {
            if self.pool.is_empty() {
                self.refill(board);
                if self.pool.is_empty() {
                    return None;
                }
            }
            let (row, col) = self.pool.pop()?;
            if board.get(row, col).map_or(false, |cell| !cell.is_marked()) {
                return Some((row, col));
            }
        }
    }

    fn place_fleet(&mut self) -> Board {
        let cells: Vec<(usize, usize)> = all_cells()
            .choose_multiple(&mut self.rng, FLEET_SIZE as usize)
            .copied()
            .collect();
        fleet_board(&cells)
    }
}

/// Replays a fixed list of moves, then sweeps the board in row-major order.
pub struct ScriptedMoves {
    moves: VecDeque<(usize, usize)>,
    fleet: Vec<(usize, usize)>,
}

impl ScriptedMoves {
    pub fn new(moves: Vec<(usize, usize)>, fleet: Vec<(usize, usize)>) -> Self {
        Self {
            moves: moves.into(),
            fleet,
        }
    }

    /// Fires row by row and keeps its fleet on the last row.
    pub fn row_major() -> Self {
        let fleet = (0..FLEET_SIZE as usize)
            .map(|col| (BOARD_SIZE - 1, col % BOARD_SIZE))
            .collect();
        Self::new(all_cells(), fleet)
    }
}

impl MoveSource for ScriptedMoves {
    fn next_target(&mut self, board: &Board) -> Option<(usize, usize)> {
        while let Some((row, col)) = self.moves.pop_front() {
            if board.get(row, col).map_or(false, |cell| !cell.is_marked()) {
                return Some((row, col));
            }
        }
        board.unmarked_cells().into_iter().next()
    }

    fn place_fleet(&mut self) -> Board {
        fleet_board(&self.fleet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked_except(free: &[(usize, usize)]) -> Board {
        let mut board = Board::new();
        for (row, col) in all_cells() {
            if !free.contains(&(row, col)) {
                board.set(row, col, CellState::Miss).unwrap();
            }
        }
        board
    }

    #[test]
    fn test_random_never_targets_marked_cells() {
        let mut opponent = RandomOpponent::new(Some(7));
        let board = marked_except(&[(1, 2), (3, 0)]);

        for _ in 0..20 {
            let target = opponent.next_target(&board).unwrap();
            assert!(target == (1, 2) || target == (3, 0));
        }
    }

    #[test]
    fn test_random_covers_board_then_refills() {
        let mut opponent = RandomOpponent::new(Some(1));
        let mut board = Board::new();
        let mut seen = Vec::new();

        while let Some((row, col)) = opponent.next_target(&board) {
            assert!(!seen.contains(&(row, col)));
            seen.push((row, col));
            board.resolve_attack(row, col).unwrap();
        }
        assert_eq!(seen.len(), BOARD_SIZE * BOARD_SIZE);
        assert_eq!(opponent.next_target(&board), None);
    }

    #[test]
    fn test_stale_pool_entries_are_skipped() {
        let mut opponent = RandomOpponent::new(Some(3));
        let mut board = Board::new();
        // Fill the pool against an empty board, then mark everything but one.
        opponent.next_target(&board).unwrap();
        for (row, col) in all_cells() {
            if (row, col) != (2, 2) {
                board.set(row, col, CellState::Hit).unwrap();
            }
        }
        assert_eq!(opponent.next_target(&board), Some((2, 2)));
    }

    #[test]
    fn test_random_fleet_size() {
        let board = RandomOpponent::new(Some(9)).place_fleet();
        assert_eq!(board.count(CellState::Ship), FLEET_SIZE as usize);
    }

    #[test]
    fn test_seeded_opponents_agree() {
        let board = Board::new();
        let mut a = RandomOpponent::new(Some(42));
        let mut b = RandomOpponent::new(Some(42));
        assert_eq!(a.place_fleet(), b.place_fleet());
        assert_eq!(a.next_target(&board), b.next_target(&board));
    }

    #[test]
    fn test_scripted_moves_in_order() {
        let mut moves = ScriptedMoves::new(vec![(0, 1), (0, 1), (2, 3)], vec![(0, 0)]);
        let mut board = Board::new();

        assert_eq!(moves.next_target(&board), Some((0, 1)));
        board.resolve_attack(0, 1).unwrap();
        assert_eq!(moves.next_target(&board), Some((2, 3)));
        board.resolve_attack(2, 3).unwrap();
        // Script exhausted: first unmarked cell.
        assert_eq!(moves.next_target(&board), Some((0, 0)));
        assert_eq!(moves.place_fleet().get(0, 0), Some(CellState::Ship));
    }

    #[test]
    fn test_row_major_fleet() {
        let board = ScriptedMoves::row_major().place_fleet();
        assert_eq!(board.count(CellState::Ship), FLEET_SIZE as usize);
        for col in 0..BOARD_SIZE {
            assert_eq!(board.get(BOARD_SIZE - 1, col), Some(CellState::Ship));
        }
    }
}
