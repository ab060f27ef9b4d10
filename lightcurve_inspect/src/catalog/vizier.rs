use std::time::Duration;

use tracing::debug;

use super::{CatalogConfig, CatalogError, CatalogRow, CatalogService, RegionQuery, RowLimit};

const COLUMNS: &str = "Source,RA_ICRS,DE_ICRS,Plx,pmRA,pmDE,Gmag";

/// VizieR cone search returning tab-separated tables.
pub struct VizierCatalog {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl VizierCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        Ok(VizierCatalog {
            client: builder.build()?,
            base_url: config.base_url.clone(),
        })
    }

    fn parameters(query: &RegionQuery) -> Vec<(&'static str, String)> {
        let max = match query.row_limit {
            RowLimit::Unlimited => "unlimited".to_string(),
            RowLimit::Limit(rows) => rows.to_string(),
        };
        vec![
            ("-source", query.catalog.clone()),
            (
                "-c",
                format!("{:.8} {:+.8}", query.center.ra, query.center.dec),
            ),
            ("-c.rs", format!("{}", query.radius_arcsec)),
            ("-out", COLUMNS.to_string()),
            ("-out.max", max),
        ]
    }
}

impl CatalogService for VizierCatalog {
    #[tracing::instrument(skip(self))]
    fn query_region(&self, query: &RegionQuery) -> Result<Option<Vec<CatalogRow>>, CatalogError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&VizierCatalog::parameters(query))
            .send()?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }
        let body = response.text()?;
        let rows = parse_tsv(&body)?;
        debug!(rows = rows.as_ref().map(|r| r.len()), "VizieR response");
        Ok(rows)
    }
}

/// Parses an `asu-tsv` response.
///
/// The table starts after the `#` comment block with a header line, a units
/// line and a line of dashes. A response without a header holds no table.
pub fn parse_tsv(body: &str) -> Result<Option<Vec<CatalogRow>>, CatalogError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut records = reader
        .records()
        .filter(|r| !matches!(r, Ok(record) if record.iter().all(|f| f.trim().is_empty())));

    let header = match records.next() {
        Some(header) => header?,
        None => return Ok(None),
    };
    let index = |name: &str| {
        header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| CatalogError::Parse(format!("missing column {}", name)))
    };
    let source = index("Source")?;
    let ra = index("RA_ICRS")?;
    let dec = index("DE_ICRS")?;
    let plx = index("Plx")?;
    let pm_ra = index("pmRA")?;
    let pm_dec = index("pmDE")?;
    let gmag = index("Gmag")?;

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let first = record.get(0).unwrap_or("").trim();
        // Units and separator lines follow the header.
        if first.chars().all(|c| c == '-') || record.get(ra).map(str::trim) == Some("deg") {
            continue;
        }

        let field = |i: usize| record.get(i).map(str::trim).filter(|f| !f.is_empty());
        let number = |i: usize| -> Result<Option<f64>, CatalogError> {
            field(i)
                .map(|f| {
                    f.parse::<f64>()
                        .map_err(|_| CatalogError::Parse(format!("invalid number {:?}", f)))
                })
                .transpose()
        };
        let required = |i: usize, name: &str| -> Result<f64, CatalogError> {
            number(i)?.ok_or_else(|| CatalogError::Parse(format!("row without {}", name)))
        };

        rows.push(CatalogRow {
            source: field(source).unwrap_or_default().to_string(),
            ra: required(ra, "RA_ICRS")?,
            dec: required(dec, "DE_ICRS")?,
            plx: number(plx)?,
            pm_ra: number(pm_ra)?,
            pm_dec: number(pm_dec)?,
            gmag: number(gmag)?,
        });
    }
    Ok(Some(rows))
}
