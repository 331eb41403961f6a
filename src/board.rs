use crate::types::TileCoord;
use bevy::prelude::*;

/// Maps between board tiles and screen space (top-left origin, y down).
#[derive(Resource, Debug, Clone, Copy, PartialEq)]
pub struct BoardGeometry {
    pub origin: Vec2,
    pub cell_size: f32,
    pub width: u32,
    pub height: u32,
}

impl BoardGeometry {
    pub fn new(origin: Vec2, cell_size: f32, width: u32, height: u32) -> Self {
        Self {
            origin,
            cell_size,
            width,
            height,
        }
    }

    /// Board centred inside a viewport of the given size.
    pub fn centered(viewport: Vec2, cell_size: f32, width: u32, height: u32) -> Self {
        let board_size = Vec2::new(width as f32, height as f32) * cell_size;
        Self::new((viewport - board_size) / 2.0, cell_size, width, height)
    }

    pub fn size(&self) -> Vec2 {
        Vec2::new(self.width as f32, self.height as f32) * self.cell_size
    }

    /// Centre of the tile.
    pub fn tile_to_space(&self, tile: TileCoord) -> Vec2 {
        self.origin
            + Vec2::new(tile.x as f32, tile.y as f32) * self.cell_size
            + Vec2::splat(self.cell_size / 2.0)
    }

    /// Only meaningful for points inside the board; check `is_within_bounds` first.
    pub fn space_to_tile(&self, point: Vec2) -> TileCoord {
        let local = (point - self.origin) / self.cell_size;
        TileCoord::new(local.x.floor() as i32, local.y.floor() as i32)
    }

    pub fn is_within_bounds(&self, point: Vec2) -> bool {
        let end = self.origin + self.size();
        point.x >= self.origin.x && point.x < end.x && point.y >= self.origin.y && point.y < end.y
    }

    pub fn contains_tile(&self, tile: TileCoord) -> bool {
        tile.x >= 0 && tile.y >= 0 && (tile.x as u32) < self.width && (tile.y as u32) < self.height
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.height as i32)
            .flat_map(move |y| (0..self.width as i32).map(move |x| TileCoord::new(x, y)))
    }
}

impl Default for BoardGeometry {
    fn default() -> Self {
        Self::centered(
            Vec2::new(800.0, 600.0),
            crate::types::DEFAULT_CELL_SIZE,
            crate::types::DEFAULT_BOARD_WIDTH,
            crate::types::DEFAULT_BOARD_HEIGHT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> BoardGeometry {
        BoardGeometry::centered(Vec2::new(800.0, 600.0), 64.0, 8, 8)
    }

    #[test]
    fn centered_origin_matches_viewport() {
        assert_eq!(board().origin, Vec2::new(144.0, 44.0));
    }

    #[test]
    fn tile_centres_round_trip() {
        let board = board();
        for tile in board.tiles() {
            let point = board.tile_to_space(tile);
            assert!(board.is_within_bounds(point));
            assert_eq!(board.space_to_tile(point), tile);
        }
    }

    #[test]
    fn first_cell_centre_maps_to_origin_tile() {
        let board = board();
        assert_eq!(board.tile_to_space(TileCoord::new(0, 0)), Vec2::new(176.0, 76.0));
        assert_eq!(board.space_to_tile(Vec2::new(144.0 + 32.0, 44.0 + 32.0)), TileCoord::new(0, 0));
    }

    #[test]
    fn bounds_are_half_open() {
        let board = board();
        let end = board.origin + board.size();
        let inside = Vec2::new(300.0, 300.0);

        assert!(board.is_within_bounds(board.origin));
        assert!(!board.is_within_bounds(board.origin - Vec2::new(1.0, 0.0)));
        assert!(!board.is_within_bounds(board.origin - Vec2::new(0.0, 1.0)));
        assert!(board.is_within_bounds(end - Vec2::ONE));
        assert!(!board.is_within_bounds(Vec2::new(end.x, inside.y)));
        assert!(!board.is_within_bounds(Vec2::new(inside.x, end.y)));
        assert!(!board.is_within_bounds(Vec2::new(end.x + 1.0, inside.y)));
        assert!(!board.is_within_bounds(Vec2::new(inside.x, end.y + 1.0)));
        assert!(board.is_within_bounds(inside));
    }

    #[test]
    fn points_left_of_origin_floor_to_negative_tiles() {
        let board = board();
        assert_eq!(board.space_to_tile(board.origin - Vec2::splat(1.0)), TileCoord::new(-1, -1));
        assert!(!board.contains_tile(TileCoord::new(-1, 0)));
        assert!(board.contains_tile(TileCoord::new(7, 7)));
        assert!(!board.contains_tile(TileCoord::new(8, 7)));
    }
}
