use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    magazine_size: Option<usize>,
    max_machines: Option<usize>,
    list_buckets: Option<usize>,
    min_capacity_index: Option<usize>,
    arena_offset_bits: Option<u32>,
    encoder_multiplier: Option<u64>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    magazine_size: usize,
    max_machines: usize,
    list_buckets: usize,
    min_capacity_index: usize,
    arena_offset_bits: u32,
    encoder_multiplier: u64,
}

/// Bit widths of the packed reference fields. The machine index and
/// generation tag are fixed at 12 bits each; the remaining 40 bits hold the
/// arena byte offset. `arena_offset_bits` may only shrink the usable arena,
/// never grow it past the field.
const MACHINE_INDEX_BITS: u32 = 12;
const GENERATION_TAG_BITS: u32 = 12;
const OFFSET_FIELD_BITS: u32 = 64 - MACHINE_INDEX_BITS - GENERATION_TAG_BITS;

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let magazine_size = cfg.magazine_size.unwrap_or(15);
    let max_machines = cfg.max_machines.unwrap_or(1024);
    let list_buckets = cfg.list_buckets.unwrap_or(32);
    let min_capacity_index = cfg.min_capacity_index.unwrap_or(3);
    let arena_offset_bits = cfg.arena_offset_bits.unwrap_or(36);
    let encoder_multiplier = cfg.encoder_multiplier.unwrap_or(0x9E37_79B9_7F4A_7C15);

    assert!(
        magazine_size >= 2 && magazine_size <= 1024,
        "magazine_size ({}) must be in 2..=1024",
        magazine_size
    );
    assert!(
        max_machines >= 2 && max_machines <= (1 << MACHINE_INDEX_BITS),
        "max_machines ({}) must be in 2..={}",
        max_machines,
        1 << MACHINE_INDEX_BITS
    );
    assert!(
        list_buckets >= 4 && list_buckets <= 48,
        "list_buckets ({}) must be in 4..=48",
        list_buckets
    );
    assert!(
        min_capacity_index >= 2 && min_capacity_index < list_buckets,
        "min_capacity_index ({}) must be in 2..{}",
        min_capacity_index,
        list_buckets
    );
    assert!(
        arena_offset_bits >= 16 && arena_offset_bits <= OFFSET_FIELD_BITS,
        "arena_offset_bits ({}) must be in 16..={}",
        arena_offset_bits,
        OFFSET_FIELD_BITS
    );
    assert!(
        encoder_multiplier & 1 == 1,
        "encoder_multiplier ({:#x}) must be odd to be invertible mod 2^64",
        encoder_multiplier
    );

    ResolvedConfig {
        magazine_size,
        max_machines,
        list_buckets,
        min_capacity_index,
        arena_offset_bits,
        encoder_multiplier,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/imsm.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         /// Entries per slab magazine.\n\
         pub const SLAB_MAGAZINE_SIZE: usize = {};\n\
         /// Capacity of the process-wide machine table. Index 0 is reserved.\n\
         pub const MAX_MACHINES: usize = {};\n\
         /// Number of size buckets in the list cache.\n\
         pub const LIST_BUCKETS: usize = {};\n\
         /// Smallest bucket: lists hold at least (1 << index) - 2 slots.\n\
         pub const MIN_CAPACITY_INDEX: usize = {};\n\
         /// Arena byte offsets must fit in this many bits.\n\
         pub const ARENA_OFFSET_BITS: u32 = {};\n\
         /// Largest arena a machine may manage, in bytes.\n\
         pub const ARENA_MAX_BYTES: u64 = 1 << ARENA_OFFSET_BITS;\n\
         /// Odd multiplier obfuscating packed reference bits.\n\
         pub const ENCODER_MULTIPLIER: u64 = {:#x};\n\
         /// Bits of the machine-index reference field.\n\
         pub const MACHINE_INDEX_BITS: u32 = {};\n\
         /// Bits of the generation-tag reference field.\n\
         pub const GENERATION_TAG_BITS: u32 = {};\n\
         /// Bits of the arena-offset reference field.\n\
         pub const OFFSET_FIELD_BITS: u32 = {};\n",
        cfg.magazine_size,
        cfg.max_machines,
        cfg.list_buckets,
        cfg.min_capacity_index,
        cfg.arena_offset_bits,
        cfg.encoder_multiplier,
        MACHINE_INDEX_BITS,
        GENERATION_TAG_BITS,
        OFFSET_FIELD_BITS,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=IMSM_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("IMSM_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);

    // The config file is optional; defaults cover every tunable.
    let config: Config = match fs::read_to_string(&config_path) {
        Ok(content) => toml::from_str(&content)
            .unwrap_or_else(|e| panic!("failed to parse {}: {}", config_path, e)),
        Err(_) => Config::default(),
    };

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
