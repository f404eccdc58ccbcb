//! Product catalog: records the engine ranks, plus JSON/CSV loading.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const SAMPLE_CATALOG: &str = include_str!("../data/sample_catalog.json");

/// Product categories with a fixed ranking weight. Anything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Footwear,
    Clothing,
    Accessories,
    Electronics,
    Other(String),
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "footwear" => Category::Footwear,
            "clothing" => Category::Clothing,
            "accessories" => Category::Accessories,
            "electronics" => Category::Electronics,
            _ => Category::Other(value),
        }
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Category::from(value.to_string())
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Footwear => "Footwear",
            Category::Clothing => "Clothing",
            Category::Accessories => "Accessories",
            Category::Electronics => "Electronics",
            Category::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub category: Category,
    /// Display price such as "$89.99"; opaque except for tie-breaking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(alias = "imageUrl")]
    pub image_url: String,
}

impl Product {
    /// Numeric price for ordering; missing or unparseable prices count as 0.
    pub fn price_value(&self) -> f64 {
        self.price
            .as_deref()
            .map(|raw| {
                raw.trim()
                    .trim_start_matches('$')
                    .replace(',', "")
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
            })
            .unwrap_or(0.0)
    }
}

/// Load a catalog from `.json` (array of products) or `.csv`
/// (`id,name,category,price,image_url`).
pub fn load_catalog(path: &Path) -> anyhow::Result<Vec<Product>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let products = match extension.as_str() {
        "json" => {
            let data = std::fs::read(path)
                .with_context(|| format!("failed to read catalog {}", path.display()))?;
            serde_json::from_slice::<Vec<Product>>(&data)
                .with_context(|| format!("catalog {} is malformed", path.display()))?
        }
        "csv" => {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("failed to open catalog {}", path.display()))?;
            reader
                .deserialize::<Product>()
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("catalog {} is malformed", path.display()))?
        }
        other => bail!("unsupported catalog format '{other}', expected .json or .csv"),
    };

    validate_catalog(&products)?;
    Ok(products)
}

/// Demo catalog bundled with the binary.
pub fn sample_catalog() -> anyhow::Result<Vec<Product>> {
    let products: Vec<Product> =
        serde_json::from_str(SAMPLE_CATALOG).context("bundled sample catalog is malformed")?;
    validate_catalog(&products)?;
    Ok(products)
}

fn validate_catalog(products: &[Product]) -> anyhow::Result<()> {
    let mut seen = HashSet::with_capacity(products.len());
    for product in products {
        if !seen.insert(product.id) {
            bail!("duplicate product id {}", product.id);
        }
        if product.image_url.trim().is_empty() {
            bail!("product {} has no image_url", product.id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_category_parsing() {
        assert_eq!(Category::from("Footwear"), Category::Footwear);
        assert_eq!(Category::from(" clothing "), Category::Clothing);
        assert_eq!(
            Category::from("Garden"),
            Category::Other("Garden".to_string())
        );
        assert_eq!(Category::from("Garden").as_str(), "Garden");
    }

    #[test]
    fn test_price_value() {
        let mut product = Product {
            id: 1,
            name: "Sneakers".to_string(),
            category: Category::Footwear,
            price: Some("$89.99".to_string()),
            image_url: "https://example.com/1.jpg".to_string(),
        };
        assert!((product.price_value() - 89.99).abs() < 1e-9);

        product.price = Some("$1,299.99".to_string());
        assert!((product.price_value() - 1299.99).abs() < 1e-9);

        product.price = Some("call us".to_string());
        assert_eq!(product.price_value(), 0.0);

        product.price = None;
        assert_eq!(product.price_value(), 0.0);
    }

    #[test]
    fn test_sample_catalog_loads() {
        let products = sample_catalog().unwrap();
        assert!(products.len() >= 12);
        assert!(products.iter().any(|p| p.category == Category::Footwear));
    }

    #[test]
    fn test_load_json_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"id": 1, "name": "Boots", "category": "Footwear", "price": "$10", "imageUrl": "https://x/1.jpg"},
                {"id": 2, "name": "Lamp", "category": "Home", "image_url": "https://x/2.jpg"}]"#,
        )
        .unwrap();

        let products = load_catalog(&path).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[1].category, Category::Other("Home".to_string()));
        assert_eq!(products[1].price, None);
    }

    #[test]
    fn test_load_csv_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "id,name,category,price,image_url").unwrap();
        writeln!(file, "1,Boots,Footwear,$10,https://x/1.jpg").unwrap();
        writeln!(file, "2,Phone,Electronics,,https://x/2.jpg").unwrap();
        drop(file);

        let products = load_catalog(&path).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].category, Category::Footwear);
        assert_eq!(products[1].price, None);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"id": 1, "name": "A", "category": "Footwear", "image_url": "https://x/1.jpg"},
                {"id": 1, "name": "B", "category": "Footwear", "image_url": "https://x/2.jpg"}]"#,
        )
        .unwrap();

        assert!(load_catalog(&path).is_err());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        assert!(load_catalog(Path::new("catalog.yaml")).is_err());
    }
}
