//! # Seed Data Generator
//!
//! Populates a tenant's local cache with a demo catalog for development.
//!
//! ## Usage
//! ```bash
//! # 200 products for store "demo" (defaults)
//! cargo run -p tally-db --bin seed
//!
//! # Custom amount, tenant and file
//! cargo run -p tally-db --bin seed -- --count 1000 --store store-1 --db ./data/tally.db
//! ```
//!
//! Every generated product is device-local (`provenance = local`), so a later
//! catalog pull keeps it until the remote learns about it.

use std::env;
use tally_core::{Product, ProductAttributes, TenantId};
use tally_db::{Database, DbConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Product families: (SKU prefix, model names)
const FAMILIES: &[(&str, &[&str])] = &[
    ("TEE", &["Basic Tee", "Pocket Tee", "V-Neck Tee", "Raglan Tee"]),
    ("JNS", &["Slim Jeans", "Straight Jeans", "Relaxed Jeans"]),
    ("HOD", &["Zip Hoodie", "Pullover Hoodie"]),
    ("SCK", &["Crew Socks", "Ankle Socks", "Wool Socks"]),
    ("CAP", &["Baseball Cap", "Beanie"]),
];

const COLORS: &[&str] = &["Black", "White", "Navy", "Grey", "Red"];

/// Size and its price addon in cents.
const SIZES: &[(&str, i64)] = &[("S", 0), ("M", 0), ("L", 100), ("XL", 200)];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./tally_dev.db");
    let mut store_id = env::var("TALLY_STORE_ID").unwrap_or_else(|_| "demo".to_string());

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--store" | "-s" => {
                if i + 1 < args.len() {
                    store_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally POS Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>     Number of products to generate (default: 200)");
                println!("  -s, --store <ID>    Tenant store id (default: $TALLY_STORE_ID or demo)");
                println!("  -d, --db <PATH>     Database file path (default: ./tally_dev.db)");
                println!("  -h, --help          Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let tenant = TenantId::new(store_id)?;
    info!(db = %db_path, store_id = %tenant, count, "Seeding demo catalog");

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let store = db.cache(tenant.clone().into());

    if store.initialize().await? {
        info!(store_id = %tenant, "Tenant initialized");
    }
    db.device_session().set(tenant.as_str(), None).await?;

    let existing: Vec<Product> = store.get().await?;
    if !existing.is_empty() {
        warn!(
            existing = existing.len(),
            "Catalog already has products; skipping seed. Delete the file to regenerate."
        );
        return Ok(());
    }

    let start = std::time::Instant::now();
    let products: Vec<Product> = catalog(&tenant).take(count).collect();

    let mut writer = store.begin_write().await?;
    for product in &products {
        writer.put(product).await?;
    }
    writer.commit().await?;

    info!(
        generated = products.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Seed complete"
    );
    Ok(())
}

/// Endless-enough iterator over family × model × color × size.
fn catalog(tenant: &TenantId) -> impl Iterator<Item = Product> + '_ {
    let mut seed = 0usize;
    FAMILIES.iter().flat_map(move |(code, models)| {
        models.iter().flat_map(move |model| {
            COLORS.iter().flat_map(move |color| {
                SIZES.iter().map(move |(size, addon)| (*code, *model, *color, *size, *addon))
            })
        })
    })
    .map(move |(code, model, color, size, addon)| {
        seed += 1;
        generate_product(tenant, code, model, color, size, addon, seed)
    })
}

/// Generates a single product with realistic data.
fn generate_product(
    tenant: &TenantId,
    code: &str,
    model: &str,
    color: &str,
    size: &str,
    price_addon: i64,
    seed: usize,
) -> Product {
    let sku = format!("{}-{}-{}-{:04}", code, &color[..3].to_uppercase(), size, seed);

    // $9.99 - $49.99 plus size addon
    let price_cents = 999 + ((seed * 37) % 4000) as i64 + price_addon;
    // 40-60% of price
    let cost_cents = price_cents * (40 + (seed % 20) as i64) / 100;
    let stock = (seed % 25) as i64;

    let mut product = Product::new_local(
        tenant,
        sku,
        format!("{model} {color} {size}"),
        stock,
        cost_cents,
        price_cents,
    );
    product.attributes = ProductAttributes {
        color: Some(color.to_string()),
        size: Some(size.to_string()),
        model: Some(model.to_string()),
    };
    product
}
