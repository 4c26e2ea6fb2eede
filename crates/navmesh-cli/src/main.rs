//! CLI utility for building and inspecting dynamic navigation data

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use glam::{IVec2, Vec3};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use navmesh_dynamic::{
    DynamicNavigationMesh, NavigationMeshConfig, NavigationPathPoint, Obstacle, StaticScene,
};

/// A CLI utility for tiled navigation meshes with dynamic obstacles
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Log debug output (RUST_LOG overrides)
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build navigation data for a flat square plane
    Build {
        /// Output navigation data file
        #[clap(long, value_parser)]
        output: PathBuf,

        /// Navigation mesh configuration (JSON); dynamic mesh defaults otherwise
        #[clap(long, value_parser)]
        config: Option<PathBuf>,

        /// Edge length of the plane, centered on the origin
        #[clap(long, default_value = "10.0")]
        size: f32,

        /// Obstacle position (x,y,z); may be repeated
        #[clap(long = "obstacle", value_parser = parse_vector)]
        obstacles: Vec<Vec3>,

        /// Radius of every obstacle
        #[clap(long, default_value = "1.0")]
        obstacle_radius: f32,

        /// Height of every obstacle
        #[clap(long, default_value = "2.0")]
        obstacle_height: f32,
    },

    /// Print the tiles of a navigation data file
    Info {
        /// Input navigation data file
        #[clap(long, value_parser)]
        input: PathBuf,
    },

    /// Export the layers of one tile
    Tile {
        /// Input navigation data file
        #[clap(long, value_parser)]
        input: PathBuf,

        /// Tile index along x
        #[clap(long, allow_hyphen_values = true)]
        x: i32,

        /// Tile index along z
        #[clap(long, allow_hyphen_values = true)]
        z: i32,

        /// Output tile data file
        #[clap(long, value_parser)]
        output: PathBuf,
    },

    /// Find a path between two points of a navigation data file
    Path {
        /// Input navigation data file
        #[clap(long, value_parser)]
        input: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        end: Vec3,

        /// Search box half extents around both points (x,y,z)
        #[clap(long, value_parser = parse_vector, default_value = "1.0,2.0,1.0")]
        extents: Vec3,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!(
            "Vector must have 3 components, got {}",
            parts.len()
        ));
    }

    let x = parts[0].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].trim().parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match args.command {
        Commands::Build {
            output,
            config,
            size,
            obstacles,
            obstacle_radius,
            obstacle_height,
        } => build_navigation(
            &output,
            config.as_deref(),
            size,
            &obstacles,
            obstacle_radius,
            obstacle_height,
        ),
        Commands::Info { input } => show_info(&input),
        Commands::Tile {
            input,
            x,
            z,
            output,
        } => export_tile(&input, IVec2::new(x, z), &output),
        Commands::Path {
            input,
            start,
            end,
            extents,
        } => find_path(&input, start, end, extents).map(|_| ()),
    }
}

/// Load a navigation mesh configuration from JSON. Missing fields keep their defaults.
fn load_config(path: &Path) -> Result<NavigationMeshConfig> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open config file: {}", path.display()))?;
    let config: NavigationMeshConfig = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

/// Build navigation data for a flat plane with optional obstacles
fn build_navigation(
    output: &Path,
    config_path: Option<&Path>,
    size: f32,
    positions: &[Vec3],
    obstacle_radius: f32,
    obstacle_height: f32,
) -> Result<()> {
    if size <= 0.0 {
        bail!("Plane size must be positive, got {}", size);
    }

    let config = match config_path {
        Some(path) => load_config(path)?,
        None => DynamicNavigationMesh::default_config(),
    };

    log::debug!("Configuration: {:?}", config);

    let half = size * 0.5;
    let mut scene = StaticScene::new();
    scene.add_quad(Vec3::new(-half, 0.0, -half), Vec3::new(half, 0.0, half), 0.0);

    let mut obstacles: Vec<Obstacle> = positions
        .iter()
        .enumerate()
        .map(|(i, &position)| Obstacle::new(i as u32 + 1, position, obstacle_radius, obstacle_height))
        .collect();

    println!("Building navigation mesh for a {}x{} plane...", size, size);

    let mut mesh = DynamicNavigationMesh::new(config).context("Invalid navigation mesh configuration")?;
    mesh.rebuild_mesh(&scene, &mut obstacles)
        .context("Failed to build navigation mesh")?;

    let tracked = obstacles.iter().filter(|o| o.is_tracked()).count();
    println!(
        "Navigation mesh built: {} tiles, {} of {} obstacles",
        mesh.get_all_tile_indices().len(),
        tracked,
        obstacles.len()
    );

    let data = mesh.navigation_data();
    fs::write(output, &data)
        .with_context(|| format!("Failed to write navigation data: {}", output.display()))?;
    println!("Saved {} bytes to {}", data.len(), output.display());

    Ok(())
}

/// Load a navigation data file into a fresh mesh
fn load_navigation(input: &Path) -> Result<DynamicNavigationMesh> {
    let data = fs::read(input)
        .with_context(|| format!("Failed to read navigation data: {}", input.display()))?;
    let mut mesh = DynamicNavigationMesh::new(DynamicNavigationMesh::default_config())?;
    mesh.set_navigation_data(&data)
        .with_context(|| format!("Failed to load navigation data: {}", input.display()))?;
    if mesh.nav_mesh().is_none() {
        bail!("{} contains no navigation data", input.display());
    }
    Ok(mesh)
}

/// Print the tiles of a navigation data file
fn show_info(input: &Path) -> Result<()> {
    let mesh = load_navigation(input)?;
    let config = mesh.config();

    println!("Navigation data: {}", input.display());
    println!(
        "Tile size: {} cells of {} x {}",
        config.tile_size, config.cell_size, config.cell_height
    );
    println!(
        "Capacity: {} tiles x {} layers, {} obstacles",
        mesh.max_tiles(),
        config.max_layers,
        config.max_obstacles
    );

    let Some(nav_mesh) = mesh.nav_mesh() else {
        return Ok(());
    };
    let indices = mesh.get_all_tile_indices();
    println!("{} tiles:", indices.len());
    for index in indices {
        let tiles = nav_mesh.get_tiles_at(index.x, index.y);
        let polys: usize = tiles.iter().map(|t| t.polys.len()).sum();
        let bounds = mesh.get_tile_bounding_box_column(index);
        println!(
            "  ({}, {}): {} layers, {} polygons, x {}..{} z {}..{}",
            index.x,
            index.y,
            tiles.len(),
            polys,
            bounds.min.x,
            bounds.max.x,
            bounds.min.z,
            bounds.max.z
        );
    }

    Ok(())
}

/// Export the layers of one tile
fn export_tile(input: &Path, index: IVec2, output: &Path) -> Result<()> {
    let mesh = load_navigation(input)?;
    let data = mesh.get_tile_data(index);
    if data.is_empty() {
        bail!("No tile at ({}, {})", index.x, index.y);
    }

    fs::write(output, &data)
        .with_context(|| format!("Failed to write tile data: {}", output.display()))?;
    println!(
        "Saved tile ({}, {}): {} bytes to {}",
        index.x,
        index.y,
        data.len(),
        output.display()
    );

    Ok(())
}

/// Print the corners of the path from `start` to `end`
fn find_path(input: &Path, start: Vec3, end: Vec3, extents: Vec3) -> Result<Vec<NavigationPathPoint>> {
    let mesh = load_navigation(input)?;
    let points = mesh.find_path_points(start, end, extents);
    if points.is_empty() {
        bail!("No path from {} to {}", start, end);
    }

    println!("{} corners:", points.len());
    for point in &points {
        let p = point.position;
        println!(
            "  ({:.2}, {:.2}, {:.2}) area {} {:?}",
            p.x, p.y, p.z, point.area_id, point.flags
        );
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("1,2.5,-3").unwrap(), Vec3::new(1.0, 2.5, -3.0));
        assert_eq!(parse_vector(" 0, 0 ,0").unwrap(), Vec3::ZERO);
        assert!(parse_vector("1,2").is_err());
        assert!(parse_vector("a,b,c").is_err());
    }

    #[test]
    fn test_load_config_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "tile_size": 32, "max_layers": 8 }}"#).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.tile_size, 32);
        assert_eq!(config.max_layers, 8);
        assert_eq!(config.cell_size, NavigationMeshConfig::default().cell_size);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "tile_size": 4 }}"#).unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_build_info_and_tile() {
        let dir = tempdir().unwrap();
        let navigation = dir.path().join("plane.nav");
        let tile = dir.path().join("tile.bin");

        build_navigation(&navigation, None, 10.0, &[Vec3::ZERO], 1.0, 2.0).unwrap();
        let mesh = load_navigation(&navigation).unwrap();
        assert_eq!(mesh.get_all_tile_indices().len(), 4);

        show_info(&navigation).unwrap();
        export_tile(&navigation, IVec2::new(-1, -1), &tile).unwrap();
        assert_eq!(fs::read(&tile).unwrap(), mesh.get_tile_data(IVec2::new(-1, -1)));

        assert!(export_tile(&navigation, IVec2::new(40, 40), &tile).is_err());
    }

    #[test]
    fn test_path_goes_around_obstacle() {
        let dir = tempdir().unwrap();
        let navigation = dir.path().join("plane.nav");
        build_navigation(&navigation, None, 10.0, &[Vec3::new(0.0, 0.0, 1.0)], 1.0, 2.0).unwrap();

        let extents = Vec3::new(1.0, 2.0, 1.0);
        let points = find_path(
            &navigation,
            Vec3::new(-3.0, 0.0, 1.0),
            Vec3::new(3.0, 0.0, 1.0),
            extents,
        )
        .unwrap();
        assert!(points.len() >= 3);

        let off_mesh = Vec3::new(50.0, 0.0, 50.0);
        assert!(find_path(&navigation, Vec3::ZERO, off_mesh, extents).is_err());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        assert!(load_navigation(file.path()).is_err());
    }
}
