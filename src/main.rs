use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use log::{LevelFilter, info};
use std::path::PathBuf;

use signscrape::cache::TileCache;
use signscrape::discovery::{get_valid_ids_in_bbox, get_valid_ids_in_tile};
use signscrape::pipeline::{WorkerPool, save_images_with_detections_by_id};
use signscrape::{BBox, Config, MapillaryClient, Tile};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Collect street-level images of traffic signs with pixel boxes",
    long_about = None
)]
#[command(group(ArgGroup::new("area").required(true).args(["bbox", "tile"])))]
struct Cli {
    /// Area to scan as "west,south,east,north" in degrees
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    bbox: Option<BBox>,

    /// A single zoom-14 tile as "z,x,y"
    #[arg(long, value_parser = parse_tile)]
    tile: Option<Tile>,

    /// Only keep signs of these classes (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    classes: Vec<String>,

    /// Only scan tiles lying entirely inside the bounding box
    #[arg(long)]
    strict: bool,

    /// Path to the output directory
    #[arg(short, long, default_value = "images")]
    output_dir: PathBuf,

    /// Write JSON sidecars only, without downloading image bytes
    #[arg(long)]
    json_only: bool,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Cache raw tiles in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Empty the tile cache before scanning
    #[arg(long, requires = "cache_dir")]
    clear_cache: bool,

    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, value_parser = parse_level)]
    log_level: Option<LevelFilter>,
}

fn parse_numbers(s: &str, count: usize) -> Result<Vec<f64>, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != count {
        return Err(format!("expected {} comma separated values, got {}", count, parts.len()));
    }
    parts
        .iter()
        .map(|p| p.parse::<f64>().map_err(|e| format!("invalid number '{}': {}", p, e)))
        .collect()
}

fn parse_bbox(s: &str) -> Result<BBox, String> {
    let v = parse_numbers(s, 4)?;
    if v[0] > v[2] || v[1] > v[3] {
        return Err("expected west <= east and south <= north".to_string());
    }
    Ok(BBox::new(v[0], v[1], v[2], v[3]))
}

fn parse_tile(s: &str) -> Result<Tile, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [z, x, y] = parts.as_slice() else {
        return Err(format!("expected z,x,y, got '{}'", s));
    };
    let z = z.parse::<u8>().map_err(|e| format!("invalid zoom '{}': {}", z, e))?;
    let x = x.parse::<u32>().map_err(|e| format!("invalid x '{}': {}", x, e))?;
    let y = y.parse::<u32>().map_err(|e| format!("invalid y '{}': {}", y, e))?;
    Ok(Tile::new(z, x, y))
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse::<LevelFilter>()
        .map_err(|_| format!("unknown log level '{}'", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = cli.log_level {
        logger.filter_level(level);
    }
    logger.init();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(cache_dir) = &cli.cache_dir {
        if cli.clear_cache {
            info!("Clearing tile cache {}", cache_dir.display());
            TileCache::new(cache_dir)
                .and_then(|cache| cache.clear())
                .context("Failed to clear tile cache")?;
        }
        config.tile_cache_dir = Some(cache_dir.clone());
    }

    let client = MapillaryClient::new(config).context("Failed to create client")?;
    let classes = (!cli.classes.is_empty()).then_some(cli.classes.as_slice());

    let features = match (cli.bbox, cli.tile) {
        (Some(bbox), _) => get_valid_ids_in_bbox(&client, &bbox, classes, cli.strict)
            .context("Failed to query traffic signs in bounding box")?,
        (None, Some(tile)) => get_valid_ids_in_tile(&client, tile, classes)
            .with_context(|| format!("Failed to query traffic signs in tile {}", tile))?,
        (None, None) => bail!("either --bbox or --tile is required"),
    };
    info!("Found {} traffic signs", features.len());

    let pool = WorkerPool::new(client.config().workers)?;
    let saved = save_images_with_detections_by_id(
        &client,
        &pool,
        &features,
        &cli.output_dir,
        cli.json_only,
    )
    .context("Failed to save images")?;

    info!("Done");
    println!(
        "{} signs, {} images saved to {}",
        features.len(),
        saved,
        cli.output_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bbox() {
        let bbox = parse_bbox("-79.40, 43.64,-79.38,43.66").unwrap();
        assert_eq!(bbox, BBox::new(-79.40, 43.64, -79.38, 43.66));
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("5,0,1,1").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
    }

    #[test]
    fn test_parse_tile() {
        assert_eq!(parse_tile("14,4578,5979").unwrap(), Tile::new(14, 4578, 5979));
        assert!(parse_tile("14,4578").is_err());
        assert!(parse_tile("14,-1,2").is_err());
    }

    #[test]
    fn test_cli_requires_an_area() {
        assert!(Cli::try_parse_from(["signscrape"]).is_err());
        let cli = Cli::try_parse_from([
            "signscrape",
            "--tile",
            "14,1,2",
            "--classes",
            "a,b",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.tile, Some(Tile::new(14, 1, 2)));
        assert_eq!(cli.classes, vec!["a", "b"]);
        assert_eq!(cli.log_level, Some(LevelFilter::Debug));
        assert_eq!(cli.output_dir, PathBuf::from("images"));
    }
}
