use std::{collections::HashMap, path::Path, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::models::Position;

/// Cell kinds of the static grid. `S`/`E` are markers on otherwise open
/// floor; anything outside the grid reads as `Wall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Wall,
    Open,
    Mud,
    Start,
    Exit,
}

impl Cell {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'X' => Some(Cell::Wall),
            '.' | ' ' => Some(Cell::Open),
            '#' => Some(Cell::Mud),
            'S' => Some(Cell::Start),
            'E' => Some(Cell::Exit),
            _ => None,
        }
    }

    /// Wire representation used by the look surface. The start marker
    /// reads as open floor once a session is underway.
    pub fn as_look_char(self) -> char {
        match self {
            Cell::Wall => 'X',
            Cell::Open | Cell::Start => '.',
            Cell::Mud => '#',
            Cell::Exit => 'E',
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MazeError {
    #[error("malformed grid: {0}")]
    Structure(String),
    #[error("invalid character {found:?} at ({x}, {y})")]
    InvalidCharacter { found: char, x: usize, y: usize },
    #[error("maze has no start cell (S)")]
    NoStart,
    #[error("maze has no exit cell (E)")]
    NoExit,
    #[error("duplicate {marker} marker: first at ({x0}, {y0}), second at ({x1}, {y1})")]
    DuplicateMarker {
        marker: char,
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    },
}

/// Immutable grid, shared read-only by every session that references it.
#[derive(Debug)]
pub struct Maze {
    grid: Vec<Vec<Cell>>,
    width: usize,
    height: usize,
    start: Position,
    exit: Position,
}

impl Maze {
    /// Parse and validate a text grid. Validation produces a distinct
    /// error kind per failure; reachability is deliberately not checked
    /// (an unsolvable maze is a legal maze).
    pub fn parse(text: &str) -> Result<Self, MazeError> {
        let trimmed = text.trim_matches('\n');
        if trimmed.trim().is_empty() {
            return Err(MazeError::Structure("grid is empty".to_string()));
        }

        let lines: Vec<&str> = trimmed.split('\n').collect();
        let width = lines[0].chars().count();
        if width == 0 {
            return Err(MazeError::Structure("grid has no columns".to_string()));
        }
        for (y, line) in lines.iter().enumerate() {
            if line.chars().count() != width {
                return Err(MazeError::Structure(format!(
                    "row {y} has length {}, expected {width}",
                    line.chars().count()
                )));
            }
        }

        let mut grid = Vec::with_capacity(lines.len());
        let mut start: Option<(usize, usize)> = None;
        let mut exit: Option<(usize, usize)> = None;

        for (y, line) in lines.iter().enumerate() {
            let mut row = Vec::with_capacity(width);
            for (x, c) in line.chars().enumerate() {
                let cell =
                    Cell::from_char(c).ok_or(MazeError::InvalidCharacter { found: c, x, y })?;
                match cell {
                    Cell::Start => {
                        if let Some((x0, y0)) = start {
                            return Err(MazeError::DuplicateMarker {
                                marker: 'S',
                                x0,
                                y0,
                                x1: x,
                                y1: y,
                            });
                        }
                        start = Some((x, y));
                    }
                    Cell::Exit => {
                        if let Some((x0, y0)) = exit {
                            return Err(MazeError::DuplicateMarker {
                                marker: 'E',
                                x0,
                                y0,
                                x1: x,
                                y1: y,
                            });
                        }
                        exit = Some((x, y));
                    }
                    _ => {}
                }
                row.push(cell);
            }
            grid.push(row);
        }

        let (sx, sy) = start.ok_or(MazeError::NoStart)?;
        let (ex, ey) = exit.ok_or(MazeError::NoExit)?;

        Ok(Self {
            height: grid.len(),
            width,
            grid,
            start: Position {
                x: sx as i32,
                y: sy as i32,
            },
            exit: Position {
                x: ex as i32,
                y: ey as i32,
            },
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn exit(&self) -> Position {
        self.exit
    }

    /// Cell at (x, y); any out-of-range coordinate is an implicit
    /// bounding wall. Never panics.
    pub fn cell_at(&self, x: i32, y: i32) -> Cell {
        if x < 0 || y < 0 {
            return Cell::Wall;
        }
        let (x, y) = (x as usize, y as usize);
        if y >= self.height || x >= self.width {
            return Cell::Wall;
        }
        self.grid[y][x]
    }
}

const TUTORIAL_GRID: &str = "\
XXXXXXXXXX
XS.......X
X.XXXXXX.X
X.X....X.X
X.X.XX.X.X
X.X.XX.X.X
X.X....X.X
X.XXXXXX.X
X........E
XXXXXXXXXX";

const MUDDY_CROSSING_GRID: &str = "\
XXXXXXXXXXXX
XS...#.....X
X.XX.XXXXX.X
X.X..#...X.X
X.X.XXXX.X.X
X...#....X.X
XXXXXXXX...E
XXXXXXXXXXXX";

#[derive(Debug, Clone, Serialize)]
pub struct MazeSummary {
    pub id: String,
    pub name: String,
    pub difficulty: String,
    pub width: usize,
    pub height: usize,
}

struct CatalogEntry {
    name: String,
    difficulty: String,
    maze: Arc<Maze>,
}

/// Named catalog of immutable mazes, loaded once at startup.
pub struct MazeCatalog {
    mazes: HashMap<String, CatalogEntry>,
}

impl MazeCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self {
            mazes: HashMap::new(),
        };
        catalog.insert(
            "tutorial",
            "Tutorial",
            "tutorial",
            Maze::parse(TUTORIAL_GRID).expect("builtin grid"),
        );
        catalog.insert(
            "muddy-crossing",
            "Muddy Crossing",
            "intermediate",
            Maze::parse(MUDDY_CROSSING_GRID).expect("builtin grid"),
        );
        catalog
    }

    fn insert(&mut self, id: &str, name: &str, difficulty: &str, maze: Maze) {
        self.mazes.insert(
            id.to_string(),
            CatalogEntry {
                name: name.to_string(),
                difficulty: difficulty.to_string(),
                maze: Arc::new(maze),
            },
        );
    }

    /// Load every `*.txt` grid under `dir`, keyed by file stem. A file
    /// that fails validation is skipped with a warning, not fatal.
    pub fn load_dir(&mut self, dir: &Path) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        entries.sort();

        for path in entries {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            match Maze::parse(&text) {
                Ok(maze) => {
                    let name = stem.replace(['_', '-'], " ");
                    self.insert(stem, &name, infer_difficulty(stem), maze);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping invalid maze file");
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Maze>> {
        self.mazes.get(id).map(|entry| entry.maze.clone())
    }

    pub fn list(&self) -> Vec<MazeSummary> {
        let mut summaries: Vec<MazeSummary> = self
            .mazes
            .iter()
            .map(|(id, entry)| MazeSummary {
                id: id.clone(),
                name: entry.name.clone(),
                difficulty: entry.difficulty.clone(),
                width: entry.maze.width(),
                height: entry.maze.height(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

fn infer_difficulty(stem: &str) -> &'static str {
    let stem = stem.to_ascii_lowercase();
    for candidate in ["tutorial", "intermediate", "challenge"] {
        if stem.contains(candidate) {
            return candidate;
        }
    }
    "tutorial"
}

#[cfg(test)]
mod tests {
    use super::{Cell, Maze, MazeError};

    #[test]
    fn parses_a_minimal_grid() {
        let maze = Maze::parse("XXXXX\nXS.EX\nXXXXX").unwrap();
        assert_eq!(maze.width(), 5);
        assert_eq!(maze.height(), 3);
        assert_eq!(maze.start().x, 1);
        assert_eq!(maze.start().y, 1);
        assert_eq!(maze.exit().x, 3);
        assert_eq!(maze.cell_at(2, 1), Cell::Open);
    }

    #[test]
    fn out_of_range_reads_as_wall() {
        let maze = Maze::parse("XXX\nXSE\nXXX").unwrap();
        assert_eq!(maze.cell_at(-1, 0), Cell::Wall);
        assert_eq!(maze.cell_at(0, -5), Cell::Wall);
        assert_eq!(maze.cell_at(99, 1), Cell::Wall);
        assert_eq!(maze.cell_at(1, 99), Cell::Wall);
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = Maze::parse("XXXX\nXSE\nXXXX").unwrap_err();
        assert!(matches!(err, MazeError::Structure(_)));
    }

    #[test]
    fn rejects_empty_grid() {
        assert!(matches!(
            Maze::parse("   \n  "),
            Err(MazeError::Structure(_))
        ));
    }

    #[test]
    fn rejects_missing_markers() {
        assert_eq!(Maze::parse("XXX\nX.E\nXXX").unwrap_err(), MazeError::NoStart);
        assert_eq!(Maze::parse("XXX\nXS.\nXXX").unwrap_err(), MazeError::NoExit);
    }

    #[test]
    fn rejects_duplicate_markers() {
        let err = Maze::parse("XSSX\nX.EX").unwrap_err();
        assert!(matches!(err, MazeError::DuplicateMarker { marker: 'S', .. }));
        let err = Maze::parse("XSEX\nX.EX").unwrap_err();
        assert!(matches!(err, MazeError::DuplicateMarker { marker: 'E', .. }));
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = Maze::parse("XSX\nX?E").unwrap_err();
        assert!(matches!(err, MazeError::InvalidCharacter { found: '?', .. }));
    }

    #[test]
    fn unsolvable_maze_is_still_legal() {
        // Reachability is a solver property, not a loader invariant.
        let maze = Maze::parse("SXE");
        assert!(maze.is_ok());
    }

    #[test]
    fn space_reads_as_open_floor() {
        let maze = Maze::parse("XXXXX\nXS EX\nXXXXX").unwrap();
        assert_eq!(maze.cell_at(2, 1), Cell::Open);
        // only a plain ASCII space, not arbitrary whitespace
        let err = Maze::parse("XXXXX\nXS\u{a0}EX\nXXXXX").unwrap_err();
        assert!(matches!(err, MazeError::InvalidCharacter { .. }));
    }

    #[test]
    fn builtin_catalog_has_tutorial() {
        let catalog = super::MazeCatalog::builtin();
        assert!(catalog.get("tutorial").is_some());
        let list = catalog.list();
        assert!(list.iter().any(|m| m.id == "muddy-crossing"));
    }
}
