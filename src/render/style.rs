//! Generated map style
//!
//! The style is a small Mapnik XML document reading from the imported
//! tables. Its identity (content hash plus [`STYLE_VERSION`]) feeds the
//! render fingerprint, so editing the template invalidates rendered tiles.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bumped whenever the generated style changes in a way that should force a re-render.
pub const STYLE_VERSION: u32 = 1;

pub const STYLE_FILE: &str = "mapnik.xml";

const MERCATOR: &str = "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +wktext +no_defs +over";

/// Layer name, Mapnik symbolizer, and the SQL subquery it draws from.
const LAYERS: &[(&str, &str, &str)] = &[
    (
        "landuse",
        r##"<PolygonSymbolizer fill="#e0dfdf"/>"##,
        "(SELECT way FROM planet_osm_polygon WHERE landuse IS NOT NULL) AS landuse",
    ),
    (
        "water",
        r##"<PolygonSymbolizer fill="#aad3df"/>"##,
        "(SELECT way FROM planet_osm_polygon WHERE \"natural\" = 'water' OR waterway IS NOT NULL) AS water",
    ),
    (
        "buildings",
        r##"<PolygonSymbolizer fill="#d9d0c9"/>"##,
        "(SELECT way FROM planet_osm_polygon WHERE building IS NOT NULL) AS buildings",
    ),
    (
        "roads",
        r##"<LineSymbolizer stroke="#ffffff" stroke-width="1.5"/>"##,
        "(SELECT way FROM planet_osm_line WHERE highway IS NOT NULL) AS roads",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSheet {
    pub path: PathBuf,
    /// Hex digest identifying content and template version.
    pub identity: String,
}

pub fn render_style(database: &str, db_user: &str) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str(&format!(
        "<Map srs=\"{}\" background-color=\"#f2efe9\">\n",
        MERCATOR
    ));

    for (name, symbolizer, _) in LAYERS {
        xml.push_str(&format!(
            "  <Style name=\"{}\">\n    <Rule>\n      {}\n    </Rule>\n  </Style>\n",
            name, symbolizer
        ));
    }

    for (name, _, table) in LAYERS {
        xml.push_str(&format!("  <Layer name=\"{}\" srs=\"{}\">\n", name, MERCATOR));
        xml.push_str(&format!("    <StyleName>{}</StyleName>\n", name));
        xml.push_str("    <Datasource>\n");
        for (key, value) in [
            ("type", "postgis"),
            ("dbname", database),
            ("user", db_user),
            ("table", table),
            ("geometry_field", "way"),
            ("srid", "3857"),
            ("extent", "-20037508,-20037508,20037508,20037508"),
        ] {
            xml.push_str(&format!(
                "      <Parameter name=\"{}\"><![CDATA[{}]]></Parameter>\n",
                key, value
            ));
        }
        xml.push_str("    </Datasource>\n  </Layer>\n");
    }

    xml.push_str("</Map>\n");
    xml
}

pub fn style_identity(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("style-v{}|", STYLE_VERSION).as_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Writes the style into `dir` and returns its path and identity.
pub fn write_style(dir: &Path, database: &str, db_user: &str) -> Result<StyleSheet> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let content = render_style(database, db_user);
    let path = dir.join(STYLE_FILE);
    fs::write(&path, &content).with_context(|| format!("Failed to write {}", path.display()))?;

    let identity = style_identity(&content);
    debug!(path = %path.display(), identity = &identity[..12], "Wrote map style");
    Ok(StyleSheet { path, identity })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_style_reads_target_database() {
        let xml = render_style("europe", "renderer");
        assert!(xml.contains("<![CDATA[europe]]>"));
        assert!(xml.contains("<![CDATA[renderer]]>"));
        assert_eq!(xml.matches("<Layer ").count(), LAYERS.len());
        assert!(xml.trim_end().ends_with("</Map>"));
    }

    #[test]
    fn test_identity_tracks_content() {
        let a = style_identity(&render_style("gis", "postgres"));
        let b = style_identity(&render_style("gis", "postgres"));
        let c = style_identity(&render_style("other", "postgres"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_write_style() {
        let dir = TempDir::new().unwrap();
        let sheet = write_style(&dir.path().join("style"), "gis", "postgres").unwrap();
        assert!(sheet.path.ends_with(STYLE_FILE));
        let content = fs::read_to_string(&sheet.path).unwrap();
        assert_eq!(style_identity(&content), sheet.identity);
    }
}
