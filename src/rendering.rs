use crate::board::BoardGeometry;
use crate::config::AppConfig;
use crate::engine::{ReconciliationEngine, UnitRenderer};
use crate::types::*;
use bevy::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

const UNIT_Z: f32 = 1.0;
const GLOW_PADDING: f32 = 8.0;

#[derive(Component)]
pub struct BoardTile;

#[derive(Component)]
pub struct UnitSprite {
    pub unit_id: UnitId,
}

#[derive(Component)]
pub struct SelectionGlow;

/// In-flight move animation. Replaced wholesale when a unit is retargeted.
#[derive(Component, Debug, Clone)]
pub struct MoveTween {
    pub from: Vec2,
    pub to: Vec2,
    pub elapsed: Duration,
    pub duration: Duration,
    pub ticket: u64,
}

impl MoveTween {
    /// Eased position after advancing by `delta`, and whether the move is done.
    pub fn advance(&mut self, delta: Duration) -> (Vec2, bool) {
        self.elapsed += delta;
        if self.duration.is_zero() || self.elapsed >= self.duration {
            return (self.to, true);
        }
        let t = self.elapsed.as_secs_f32() / self.duration.as_secs_f32();
        (self.from.lerp(self.to, ease_out_cubic(t)), false)
    }
}

fn ease_out_cubic(t: f32) -> f32 {
    1.0 - (1.0 - t.clamp(0.0, 1.0)).powi(3)
}

#[derive(Debug, Clone, Copy)]
struct UnitEntity {
    root: Entity,
    glow: Entity,
}

#[derive(Resource, Default)]
pub struct UnitEntities(HashMap<UnitId, UnitEntity>);

impl UnitEntities {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.0.contains_key(unit_id)
    }
}

/// Board space is top-left origin with y down; the 2D camera looks at the board's
/// centre with y up.
pub fn space_to_world(point: Vec2, board: &BoardGeometry) -> Vec2 {
    let centre = board.origin + board.size() / 2.0;
    Vec2::new(point.x - centre.x, centre.y - point.y)
}

pub fn world_to_space(world: Vec2, board: &BoardGeometry) -> Vec2 {
    let centre = board.origin + board.size() / 2.0;
    Vec2::new(world.x + centre.x, centre.y - world.y)
}

fn unit_color(kind: UnitKind) -> Color {
    match kind {
        UnitKind::A => Color::srgb(0.25, 0.55, 0.95),
        UnitKind::B => Color::srgb(0.95, 0.35, 0.3),
    }
}

fn tile_color(tile: TileCoord) -> Color {
    if (tile.x + tile.y) % 2 == 0 {
        Color::srgb_u8(0x00, 0x4d, 0x40)
    } else {
        Color::srgb_u8(0x00, 0x69, 0x5c)
    }
}

/// [`UnitRenderer`] backed by sprites.
pub struct SpriteRenderer<'a, 'w, 's> {
    commands: &'a mut Commands<'w, 's>,
    entities: &'a mut UnitEntities,
    /// Where each unit sprite is drawn right now, for starting tweens mid-flight.
    positions: HashMap<Entity, Vec2>,
    board: BoardGeometry,
    move_duration: Duration,
}

impl SpriteRenderer<'_, '_, '_> {
    fn tile_translation(&self, tile: TileCoord) -> Vec3 {
        space_to_world(self.board.tile_to_space(tile), &self.board).extend(UNIT_Z)
    }
}

impl UnitRenderer for SpriteRenderer<'_, '_, '_> {
    fn spawn_unit(&mut self, unit_id: &str, kind: UnitKind) {
        let size = Vec2::splat(self.board.cell_size);
        let glow = self
            .commands
            .spawn((
                Sprite::from_color(Color::srgb(1.0, 1.0, 0.0), size + GLOW_PADDING),
                Transform::from_xyz(0.0, 0.0, -0.5),
                Visibility::Hidden,
                SelectionGlow,
            ))
            .id();
        let root = self
            .commands
            .spawn((
                Sprite::from_color(unit_color(kind), size),
                Transform::from_xyz(0.0, 0.0, UNIT_Z),
                Visibility::Hidden,
                UnitSprite {
                    unit_id: unit_id.to_string(),
                },
            ))
            .add_child(glow)
            .id();
        self.entities
            .0
            .insert(unit_id.to_string(), UnitEntity { root, glow });
        debug!("Spawned sprite for unit {} ({})", unit_id, kind);
    }

    fn place_unit(&mut self, unit_id: &str, tile: TileCoord) {
        let Some(entity) = self.entities.0.get(unit_id).copied() else {
            return;
        };
        let translation = self.tile_translation(tile);
        self.commands
            .entity(entity.root)
            .insert((Transform::from_translation(translation), Visibility::Inherited))
            .remove::<MoveTween>();
    }

    fn animate_unit_to(&mut self, unit_id: &str, tile: TileCoord, ticket: u64) {
        let Some(entity) = self.entities.0.get(unit_id).copied() else {
            return;
        };
        let to = self.tile_translation(tile).truncate();
        let from = self.positions.get(&entity.root).copied().unwrap_or(to);
        self.commands.entity(entity.root).insert((
            MoveTween {
                from,
                to,
                elapsed: Duration::ZERO,
                duration: self.move_duration,
                ticket,
            },
            Visibility::Inherited,
        ));
    }

    fn set_selection_visible(&mut self, unit_id: &str, visible: bool) {
        let Some(entity) = self.entities.0.get(unit_id).copied() else {
            return;
        };
        let visibility = if visible {
            Visibility::Inherited
        } else {
            Visibility::Hidden
        };
        self.commands.entity(entity.glow).insert(visibility);
    }

    fn despawn_unit(&mut self, unit_id: &str) {
        if let Some(entity) = self.entities.0.remove(unit_id) {
            self.commands.entity(entity.root).despawn();
            debug!("Despawned sprite for unit {}", unit_id);
        }
    }
}

pub fn setup_board_scene(mut commands: Commands, board: Res<BoardGeometry>) {
    commands.spawn((Camera2d, GameCamera));
    commands.insert_resource(ClearColor(Color::srgb(0.1, 0.1, 0.1)));
    commands.insert_resource(UnitEntities::default());

    // One pixel short of the cell so the clear colour shows through as grid lines.
    let tile_size = Vec2::splat((board.cell_size - 1.0).max(1.0));
    for tile in board.tiles() {
        let position = space_to_world(board.tile_to_space(tile), &board);
        commands.spawn((
            Sprite::from_color(tile_color(tile), tile_size),
            Transform::from_translation(position.extend(0.0)),
            BoardTile,
        ));
    }
    info!("Board scene ready with {} tiles", board.width * board.height);
}

pub fn render_units(
    mut commands: Commands,
    mut engine: ResMut<ReconciliationEngine>,
    mut entities: ResMut<UnitEntities>,
    transforms: Query<(Entity, &Transform), With<UnitSprite>>,
    config: Res<AppConfig>,
) {
    let positions = transforms
        .iter()
        .map(|(entity, transform)| (entity, transform.translation.truncate()))
        .collect();
    let mut renderer = SpriteRenderer {
        commands: &mut commands,
        entities: &mut entities,
        positions,
        board: *engine.board(),
        move_duration: Duration::from_millis(config.board.move_duration_ms),
    };
    engine.render_to(&mut renderer);
}

pub fn animate_units(
    mut commands: Commands,
    time: Res<Time>,
    mut query: Query<(Entity, &UnitSprite, &mut Transform, &mut MoveTween)>,
    mut finished_events: EventWriter<MoveFinishedEvent>,
) {
    for (entity, unit, mut transform, mut tween) in &mut query {
        let (position, done) = tween.advance(time.delta());
        let z = transform.translation.z;
        transform.translation = position.extend(z);
        if done {
            commands.entity(entity).remove::<MoveTween>();
            finished_events.write(MoveFinishedEvent {
                unit_id: unit.unit_id.clone(),
                ticket: tween.ticket,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> BoardGeometry {
        BoardGeometry::centered(Vec2::new(800.0, 600.0), 64.0, 8, 8)
    }

    #[test]
    fn board_centre_is_world_origin() {
        let board = board();
        assert_eq!(space_to_world(Vec2::new(400.0, 300.0), &board), Vec2::ZERO);
        // Top-left tile sits up and to the left of the origin.
        let corner = space_to_world(board.tile_to_space(TileCoord::new(0, 0)), &board);
        assert_eq!(corner, Vec2::new(-224.0, 224.0));
        assert_eq!(world_to_space(corner, &board), Vec2::new(176.0, 76.0));
    }

    #[test]
    fn tween_eases_out_and_lands_on_target() {
        let mut tween = MoveTween {
            from: Vec2::ZERO,
            to: Vec2::new(100.0, 0.0),
            elapsed: Duration::ZERO,
            duration: Duration::from_millis(300),
            ticket: 1,
        };
        let (halfway, done) = tween.advance(Duration::from_millis(150));
        assert!(!done);
        assert!(halfway.x > 50.0, "ease-out should be past the midpoint");

        let (end, done) = tween.advance(Duration::from_millis(200));
        assert!(done);
        assert_eq!(end, Vec2::new(100.0, 0.0));
    }

    fn render_app() -> App {
        let mut app = App::new();
        let mut engine = ReconciliationEngine::new(board());
        engine.setup_initial_units(Identity::new("alice"));
        app.insert_resource(engine)
            .insert_resource(AppConfig::default())
            .insert_resource(UnitEntities::default())
            .insert_resource(Time::<()>::default())
            .add_event::<MoveFinishedEvent>()
            .add_systems(Update, (render_units, animate_units).chain());
        app
    }

    #[test]
    fn initial_units_get_placed_sprites() {
        let mut app = render_app();
        app.update();

        assert_eq!(app.world().resource::<UnitEntities>().len(), 2);
        let world = app.world_mut();
        let mut sprites = world.query::<(&UnitSprite, &Transform, &Visibility)>();
        let mut placed: Vec<_> = sprites
            .iter(world)
            .map(|(unit, transform, visibility)| {
                (unit.unit_id.clone(), transform.translation.truncate(), *visibility)
            })
            .collect();
        placed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(placed[0].1, Vec2::new(-224.0, 224.0));
        assert_eq!(placed[1].1, Vec2::new(224.0, -224.0));
        assert!(placed.iter().all(|p| p.2 == Visibility::Inherited));
    }

    #[test]
    fn removed_unit_loses_its_sprite() {
        let mut app = render_app();
        app.update();

        let mut snapshot = UnitsSnapshot::new();
        snapshot.insert(
            "unit_1".to_string(),
            UnitSnapshot {
                position: Some(TileCoord::new(0, 0)),
                moved_by: Some("alice".to_string()),
            },
        );
        app.world_mut()
            .resource_mut::<ReconciliationEngine>()
            .reconcile(&snapshot);
        app.update();

        let entities = app.world().resource::<UnitEntities>();
        assert!(entities.contains("unit_1"));
        assert!(!entities.contains("unit_2"));
        let world = app.world_mut();
        assert_eq!(world.query::<&UnitSprite>().iter(world).count(), 1);
    }

    #[test]
    fn zero_length_move_finishes_with_its_ticket() {
        let mut app = render_app();
        app.world_mut()
            .resource_mut::<AppConfig>()
            .board
            .move_duration_ms = 0;
        app.update();

        let mut snapshot = UnitsSnapshot::new();
        for (id, tile) in [("unit_1", TileCoord::new(1, 1)), ("unit_2", TileCoord::new(7, 7))] {
            snapshot.insert(
                id.to_string(),
                UnitSnapshot {
                    position: Some(tile),
                    moved_by: Some("alice".to_string()),
                },
            );
        }
        app.world_mut()
            .resource_mut::<ReconciliationEngine>()
            .reconcile(&snapshot);
        // Extra update lets the finish event land regardless of command flush timing.
        app.update();
        app.update();

        let events = app.world().resource::<Events<MoveFinishedEvent>>();
        let mut reader = events.get_cursor();
        let finished: Vec<_> = reader
            .read(events)
            .map(|e| (e.unit_id.clone(), e.ticket))
            .collect();
        assert_eq!(finished, vec![("unit_1".to_string(), 1)]);
    }
}
