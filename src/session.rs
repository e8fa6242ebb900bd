use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    maze::{Cell, Maze},
    models::{Direction, MoveStatus, Position, SessionStatus},
};

/// Phase of the mud stall cycle. Stepping onto mud costs the turn and
/// arms a stall; the next move attempt is forfeited (turn counted, no
/// movement); the attempt after that behaves normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MudState {
    None,
    /// Landed on mud; the next move attempt is forfeited.
    Entered,
    /// The stall was spent; cleared when the session lands somewhere.
    Stuck,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveReport {
    pub status: MoveStatus,
    pub position: Position,
    pub turns: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LookReport {
    pub north: Cell,
    pub south: Cell,
    pub east: Cell,
    pub west: Cell,
    pub current: Cell,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is {0:?}, not active")]
    NotActive(SessionStatus),
}

/// One attempt at one maze. Mutated only through `move_`/`abandon`;
/// at most one caller drives a session at a time (the registry wraps
/// each session in an async mutex to hold that line at the API edge).
pub struct Session {
    pub id: Uuid,
    pub user: String,
    pub maze_id: String,
    maze: Arc<Maze>,
    position: Position,
    turn_count: u32,
    mud_state: MudState,
    status: SessionStatus,
    last_activity: Instant,
}

impl Session {
    fn new(id: Uuid, user: String, maze_id: String, maze: Arc<Maze>) -> Self {
        let position = maze.start();
        Self {
            id,
            user,
            maze_id,
            maze,
            position,
            turn_count: 0,
            mud_state: MudState::None,
            status: SessionStatus::Active,
            last_activity: Instant::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn turns(&self) -> u32 {
        self.turn_count
    }

    /// Read the four neighbor cells. Free: no turn cost, no state
    /// change, legal in any state (a terminal session reports its
    /// frozen view).
    pub fn look(&self) -> LookReport {
        let Position { x, y } = self.position;
        LookReport {
            north: self.maze.cell_at(x, y - 1),
            south: self.maze.cell_at(x, y + 1),
            east: self.maze.cell_at(x + 1, y),
            west: self.maze.cell_at(x - 1, y),
            current: self.maze.cell_at(x, y),
        }
    }

    /// Attempt one move. Wall collisions are free; every other outcome
    /// costs exactly one turn. Reaching the exit completes the session
    /// and freezes the score.
    pub fn move_(&mut self, direction: Direction) -> Result<MoveReport, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive(self.status));
        }
        self.last_activity = Instant::now();

        // An armed stall consumes the attempt outright, even when it
        // points at the exit.
        if self.mud_state == MudState::Entered {
            self.mud_state = MudState::Stuck;
            self.turn_count += 1;
            return Ok(self.report(MoveStatus::Stuck));
        }

        let target = self.position.step(direction);
        match self.maze.cell_at(target.x, target.y) {
            // Collisions are free and leave mud-state untouched.
            Cell::Wall => Ok(self.report(MoveStatus::Blocked)),
            Cell::Mud => {
                self.position = target;
                self.turn_count += 1;
                self.mud_state = MudState::Entered;
                Ok(self.report(MoveStatus::Mud))
            }
            Cell::Exit => {
                // Arrival short-circuits any mud bookkeeping.
                self.position = target;
                self.turn_count += 1;
                self.mud_state = MudState::None;
                self.status = SessionStatus::Completed;
                Ok(self.report(MoveStatus::Completed))
            }
            Cell::Open | Cell::Start => {
                self.position = target;
                self.turn_count += 1;
                self.mud_state = MudState::None;
                Ok(self.report(MoveStatus::Moved))
            }
        }
    }

    /// `active -> abandoned`. Idempotent on an abandoned session; a
    /// completed session keeps its frozen score and rejects.
    pub fn abandon(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Active => {
                self.status = SessionStatus::Abandoned;
                Ok(())
            }
            SessionStatus::Abandoned => Ok(()),
            SessionStatus::Completed => Err(SessionError::NotActive(self.status)),
        }
    }

    fn report(&self, status: MoveStatus) -> MoveReport {
        MoveReport {
            status,
            position: self.position,
            turns: self.turn_count,
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

struct Entry {
    session: Arc<Mutex<Session>>,
    token: String,
}

/// Owns every live session and the capability token that gates it.
/// Sandboxed code receives only its own session's token, never ambient
/// authority over other sessions.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Entry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a fresh session on `maze` and issue its token.
    pub fn create(&self, user: &str, maze_id: &str, maze: Arc<Maze>) -> (Uuid, String) {
        let id = Uuid::new_v4();
        let token = format!("sess_{}", Uuid::new_v4().as_simple());
        let session = Session::new(id, user.to_string(), maze_id.to_string(), maze);
        self.sessions.insert(
            id,
            Entry {
                session: Arc::new(Mutex::new(session)),
                token: token.clone(),
            },
        );
        (id, token)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|e| e.session.clone())
    }

    /// Token check for the session API. Constant-time compare; the
    /// token is the only credential a sandboxed program holds.
    pub fn authorize(&self, id: &Uuid, token: &str) -> Option<Arc<Mutex<Session>>> {
        let entry = self.sessions.get(id)?;
        if constant_time_eq(entry.token.as_bytes(), token.as_bytes()) {
            Some(entry.session.clone())
        } else {
            None
        }
    }

    pub fn remove(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    /// Mark sessions idle beyond `max_idle` as abandoned and drop
    /// terminal ones that have also gone idle. Driven by a periodic
    /// task, not by the engine itself.
    pub async fn sweep_idle(&self, max_idle: Duration) {
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(session) = self.get(&id) else {
                continue;
            };
            let mut session = session.lock().await;
            if session.idle_for() < max_idle {
                continue;
            }
            match session.status() {
                SessionStatus::Active => {
                    let _ = session.abandon();
                    tracing::info!(session_id = %id, "abandoned idle session");
                }
                _ => {
                    drop(session);
                    self.sessions.remove(&id);
                }
            }
        }
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (l, r) in a.iter().zip(b.iter()) {
        out |= l ^ r;
    }
    out == 0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Session, SessionRegistry};
    use crate::{
        maze::Maze,
        models::{Direction, MoveStatus, SessionStatus},
    };

    fn session_on(grid: &str) -> Session {
        let maze = Arc::new(Maze::parse(grid).unwrap());
        Session::new(
            uuid::Uuid::new_v4(),
            "tester".to_string(),
            "test-maze".to_string(),
            maze,
        )
    }

    #[test]
    fn straight_run_to_the_exit_scores_two() {
        let mut session = session_on("XXXXX\nXS.EX\nXXXXX");
        let first = session.move_(Direction::East).unwrap();
        assert_eq!(first.status, MoveStatus::Moved);
        assert_eq!(first.turns, 1);

        let second = session.move_(Direction::East).unwrap();
        assert_eq!(second.status, MoveStatus::Completed);
        assert_eq!(second.turns, 2);
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[test]
    fn wall_collisions_are_free() {
        let mut session = session_on("XXXXX\nXS.EX\nXXXXX");
        let blocked = session.move_(Direction::North).unwrap();
        assert_eq!(blocked.status, MoveStatus::Blocked);
        assert_eq!(blocked.turns, 0);
        assert_eq!(blocked.position, session.position());

        // out of bounds behaves like a wall
        let mut edge = session_on("S.E");
        let blocked = edge.move_(Direction::West).unwrap();
        assert_eq!(blocked.status, MoveStatus::Blocked);
        assert_eq!(blocked.turns, 0);
    }

    #[test]
    fn mud_forfeits_exactly_one_attempt() {
        let mut session = session_on("XXXXXX\nXS#.EX\nXXXXXX");

        let onto_mud = session.move_(Direction::East).unwrap();
        assert_eq!(onto_mud.status, MoveStatus::Mud);
        assert_eq!(onto_mud.turns, 1);

        let stalled = session.move_(Direction::East).unwrap();
        assert_eq!(stalled.status, MoveStatus::Stuck);
        assert_eq!(stalled.turns, 2);
        assert_eq!(stalled.position, onto_mud.position);

        let resumed = session.move_(Direction::East).unwrap();
        assert_eq!(resumed.status, MoveStatus::Moved);
        assert_eq!(resumed.turns, 3);
    }

    #[test]
    fn stall_consumes_the_attempt_before_the_wall_check() {
        // Stepping into mud then aiming at a wall yields stuck, not
        // blocked, and the stuck attempt still costs its turn.
        let mut session = session_on("XXXXX\nXS#XX\nXX.EX\nXXXXX");

        assert_eq!(session.move_(Direction::East).unwrap().status, MoveStatus::Mud);
        let stalled = session.move_(Direction::East).unwrap();
        assert_eq!(stalled.status, MoveStatus::Stuck);
        assert_eq!(stalled.turns, 2);

        let south = session.move_(Direction::South).unwrap();
        assert_eq!(south.status, MoveStatus::Moved);
        assert_eq!(south.turns, 3);
    }

    #[test]
    fn stall_blocks_even_a_move_aimed_at_the_exit() {
        let mut session = session_on("XXXXX\nXS#EX\nXXXXX");

        assert_eq!(session.move_(Direction::East).unwrap().status, MoveStatus::Mud);
        let stalled = session.move_(Direction::East).unwrap();
        assert_eq!(stalled.status, MoveStatus::Stuck);
        assert_eq!(session.status(), SessionStatus::Active);

        let arrived = session.move_(Direction::East).unwrap();
        assert_eq!(arrived.status, MoveStatus::Completed);
        assert_eq!(arrived.turns, 3);
    }

    #[test]
    fn wall_collision_after_a_stall_is_still_free() {
        let mut session = session_on("XXXXX\nXS#XX\nXXXXX");
        assert_eq!(session.move_(Direction::East).unwrap().status, MoveStatus::Mud);
        assert_eq!(session.move_(Direction::South).unwrap().status, MoveStatus::Stuck);
        assert_eq!(session.move_(Direction::South).unwrap().status, MoveStatus::Blocked);
        assert_eq!(session.turns(), 2);
    }

    #[test]
    fn completed_sessions_reject_further_moves() {
        let mut session = session_on("XXXX\nXSEX\nXXXX");
        assert_eq!(
            session.move_(Direction::East).unwrap().status,
            MoveStatus::Completed
        );
        let score = session.turns();
        assert!(session.move_(Direction::West).is_err());
        assert_eq!(session.turns(), score);
    }

    #[test]
    fn look_is_free_and_never_fails() {
        let mut session = session_on("XXXX\nXSEX\nXXXX");
        let view = session.look();
        assert_eq!(view.east, crate::maze::Cell::Exit);
        assert_eq!(view.north, crate::maze::Cell::Wall);
        assert_eq!(session.turns(), 0);

        session.move_(Direction::East).unwrap();
        // frozen view after completion
        let view = session.look();
        assert_eq!(view.current, crate::maze::Cell::Exit);
    }

    #[test]
    fn abandon_is_idempotent_from_active_only() {
        let mut session = session_on("XXXX\nXSEX\nXXXX");
        session.abandon().unwrap();
        assert_eq!(session.status(), SessionStatus::Abandoned);
        session.abandon().unwrap();

        let mut done = session_on("XXXX\nXSEX\nXXXX");
        done.move_(Direction::East).unwrap();
        assert!(done.abandon().is_err());
    }

    #[tokio::test]
    async fn registry_authorizes_only_the_issued_token() {
        let registry = SessionRegistry::new();
        let maze = Arc::new(Maze::parse("XXXX\nXSEX\nXXXX").unwrap());
        let (id, token) = registry.create("tester", "test-maze", maze);

        assert!(registry.authorize(&id, &token).is_some());
        assert!(registry.authorize(&id, "sess_forged").is_none());
        assert!(registry.authorize(&uuid::Uuid::new_v4(), &token).is_none());
    }

    #[tokio::test]
    async fn idle_sweep_abandons_active_sessions() {
        let registry = SessionRegistry::new();
        let maze = Arc::new(Maze::parse("XXXX\nXSEX\nXXXX").unwrap());
        let (id, _token) = registry.create("tester", "test-maze", maze);

        registry.sweep_idle(std::time::Duration::ZERO).await;
        let session = registry.get(&id).unwrap();
        assert_eq!(session.lock().await.status(), SessionStatus::Abandoned);

        // a second sweep drops the now-terminal session
        registry.sweep_idle(std::time::Duration::ZERO).await;
        assert!(registry.get(&id).is_none());
    }
}
