use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    alignment: Option<usize>,
    max_small: Option<usize>,
    max_span_bytes: Option<usize>,
    min_batches_per_span: Option<usize>,
    min_system_pages: Option<usize>,
    max_pages: Option<usize>,
    max_batch_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    alignment: usize,
    max_small: usize,
    max_span_bytes: usize,
    min_batches_per_span: usize,
    min_system_pages: usize,
    max_pages: usize,
    max_batch_bytes: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(4096);
    assert!(
        page_size >= 4096 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2 and >= 4096",
        page_size
    );

    let alignment = cfg.alignment.unwrap_or(8);
    assert!(
        alignment.is_power_of_two() && alignment >= 8,
        "alignment ({}) must be a power of 2 and >= 8 (a free object stores a pointer)",
        alignment
    );

    let max_small = cfg.max_small.unwrap_or(256 * 1024);
    assert!(
        max_small % alignment == 0,
        "max_small ({}) must be a multiple of alignment ({})",
        max_small,
        alignment
    );
    assert!(
        max_small >= page_size,
        "max_small ({}) must be >= page_size ({})",
        max_small,
        page_size
    );

    let max_span_bytes = cfg.max_span_bytes.unwrap_or(128 * 1024);
    assert!(
        max_span_bytes % page_size == 0 && max_span_bytes > 0,
        "max_span_bytes ({}) must be a positive multiple of page_size ({})",
        max_span_bytes,
        page_size
    );

    let min_batches_per_span = cfg.min_batches_per_span.unwrap_or(8);
    assert!(min_batches_per_span > 0, "min_batches_per_span must be > 0");

    let min_system_pages = cfg.min_system_pages.unwrap_or(128);
    assert!(min_system_pages > 0, "min_system_pages must be > 0");

    let max_pages = cfg.max_pages.unwrap_or(256);
    assert!(
        max_pages >= min_system_pages,
        "max_pages ({}) must be >= min_system_pages ({})",
        max_pages,
        min_system_pages
    );

    let max_batch_bytes = cfg.max_batch_bytes.unwrap_or(4096);
    assert!(
        max_batch_bytes >= alignment,
        "max_batch_bytes ({}) must be >= alignment ({})",
        max_batch_bytes,
        alignment
    );

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        alignment,
        max_small,
        max_span_bytes,
        min_batches_per_span,
        min_system_pages,
        max_pages,
        max_batch_bytes,
    }
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const ALIGNMENT: usize = {};\n\
         pub const MAX_SMALL: usize = {};\n\
         pub const MAX_SPAN_BYTES: usize = {};\n\
         pub const MIN_BATCHES_PER_SPAN: usize = {};\n\
         pub const MIN_SYSTEM_PAGES: usize = {};\n\
         pub const MAX_PAGES: usize = {};\n\
         pub const MAX_BATCH_BYTES: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.alignment,
        cfg.max_small,
        cfg.max_span_bytes,
        cfg.min_batches_per_span,
        cfg.min_system_pages,
        cfg.max_pages,
        cfg.max_batch_bytes,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/tieralloc.toml", manifest_dir)
}

fn main() {
    println!("cargo:rerun-if-env-changed=TIERALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("TIERALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
