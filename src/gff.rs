//! GFF3 functional-annotation files loaded into an in-memory SQLite table.
//!
//! The table is named `features` and can be queried directly through
//! [`GffReader::query_sql`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::NmdcError;
use crate::fs_util::write_atomic;

/// Attributes lifted out of column 9 into their own columns.
pub const ATTRIBUTE_COLUMNS: [&str; 11] = [
    "ID",
    "product",
    "ec_number",
    "pfam",
    "cog",
    "ko",
    "tigrfam",
    "smart",
    "cath_funfam",
    "superfamily",
    "product_source",
];

pub const FEATURE_COLUMNS: [&str; 20] = [
    "seqid",
    "source",
    "type",
    "start",
    "end",
    "score",
    "strand",
    "phase",
    "attributes",
    "ID",
    "product",
    "ec_number",
    "pfam",
    "cog",
    "ko",
    "tigrfam",
    "smart",
    "cath_funfam",
    "superfamily",
    "product_source",
];

const SELECT_FEATURES: &str = r#"SELECT seqid, source, type, start, "end", score, strand, phase,
    attributes, ID, product, ec_number, pfam, cog, ko, tigrfam, smart, cath_funfam,
    superfamily, product_source FROM features"#;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GffFeature {
    pub seqid: String,
    pub source: String,
    #[serde(rename = "type")]
    pub feature_type: String,
    pub start: i64,
    pub end: i64,
    pub score: Option<f64>,
    pub strand: String,
    pub phase: String,
    pub attributes: String,
    #[serde(rename = "ID")]
    pub id: Option<String>,
    pub product: Option<String>,
    pub ec_number: Option<String>,
    pub pfam: Option<String>,
    pub cog: Option<String>,
    pub ko: Option<String>,
    pub tigrfam: Option<String>,
    pub smart: Option<String>,
    pub cath_funfam: Option<String>,
    pub superfamily: Option<String>,
    pub product_source: Option<String>,
}

impl GffFeature {
    /// Value of a lifted attribute column by its column name.
    pub fn annotation(&self, column: &str) -> Option<&str> {
        match column {
            "ID" => self.id.as_deref(),
            "product" => self.product.as_deref(),
            "ec_number" => self.ec_number.as_deref(),
            "pfam" => self.pfam.as_deref(),
            "cog" => self.cog.as_deref(),
            "ko" => self.ko.as_deref(),
            "tigrfam" => self.tigrfam.as_deref(),
            "smart" => self.smart.as_deref(),
            "cath_funfam" => self.cath_funfam.as_deref(),
            "superfamily" => self.superfamily.as_deref(),
            "product_source" => self.product_source.as_deref(),
            _ => None,
        }
    }

    fn cell(&self, column: &str) -> String {
        match column {
            "seqid" => self.seqid.clone(),
            "source" => self.source.clone(),
            "type" => self.feature_type.clone(),
            "start" => self.start.to_string(),
            "end" => self.end.to_string(),
            "score" => self.score.map(|score| score.to_string()).unwrap_or_default(),
            "strand" => self.strand.clone(),
            "phase" => self.phase.clone(),
            "attributes" => self.attributes.clone(),
            other => self.annotation(other).unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BgcAnnotations {
    pub ec_numbers: BTreeSet<String>,
    pub pfams: BTreeSet<String>,
    pub cogs: BTreeSet<String>,
}

/// A run of CDS features on one sequence whose gaps never exceed the allowed
/// distance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BgcCandidate {
    pub seqid: String,
    pub start: i64,
    pub end: i64,
    pub gene_count: usize,
    pub genes: Vec<String>,
    pub annotations: BgcAnnotations,
}

impl BgcCandidate {
    fn from_genes(genes: &[GffFeature]) -> Option<Self> {
        let first = genes.first()?;
        let last = genes.last()?;
        let collect = |column: &str| -> BTreeSet<String> {
            genes
                .iter()
                .filter_map(|gene| gene.annotation(column))
                .map(str::to_string)
                .collect()
        };
        Some(Self {
            seqid: first.seqid.clone(),
            start: first.start,
            end: last.end,
            gene_count: genes.len(),
            genes: genes
                .iter()
                .map(|gene| {
                    gene.id
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}-{}", gene.seqid, gene.start, gene.end))
                })
                .collect(),
            annotations: BgcAnnotations {
                ec_numbers: collect("ec_number"),
                pfams: collect("pfam"),
                cogs: collect("cog"),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GffSummary {
    pub total_features: u64,
    pub feature_types: BTreeMap<String, u64>,
    /// Sequence ids in file order.
    pub sequences: Vec<String>,
    pub has_ec: u64,
    pub has_pfam: u64,
    pub has_cog: u64,
    pub has_ko: u64,
}

pub struct GffReader {
    conn: Connection,
    path: Utf8PathBuf,
}

impl GffReader {
    /// Loads a GFF3 file; gzip input is detected from its magic bytes.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, NmdcError> {
        let path = path.as_ref();
        let mut file = File::open(path.as_std_path())
            .map_err(|err| NmdcError::Filesystem(format!("GFF file not found: {path} ({err})")))?;
        let mut magic = [0u8; 2];
        let read = file
            .read(&mut magic)
            .map_err(|err| NmdcError::Filesystem(format!("read {path}: {err}")))?;
        let file = File::open(path.as_std_path())
            .map_err(|err| NmdcError::Filesystem(format!("reopen {path}: {err}")))?;
        let reader: Box<dyn BufRead> = if read == 2 && magic == GZIP_MAGIC {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let gff = Self::from_reader(reader)?;
        info!(path = %path, "loaded GFF file");
        Ok(Self {
            path: path.to_path_buf(),
            ..gff
        })
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, NmdcError> {
        let pfam_type = Regex::new(r"^PF\d{5}$")
            .map_err(|err| NmdcError::InvalidArgument(err.to_string()))?;
        let mut conn = Connection::open_in_memory()?;
        create_schema(&conn)?;

        let tx = conn.transaction()?;
        let mut loaded = 0usize;
        let mut pfam_from_type = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO features (seqid, source, type, start, "end", score, strand, phase,
                    attributes, ID, product, ec_number, pfam, cog, ko, tigrfam, smart,
                    cath_funfam, superfamily, product_source)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20)"#,
            )?;
            for (index, line) in reader.lines().enumerate() {
                let line_no = index + 1;
                let line = line.map_err(|err| NmdcError::GffParse {
                    line: line_no,
                    message: err.to_string(),
                })?;
                if line.starts_with("##FASTA") {
                    break;
                }
                if line.trim().is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut feature = parse_line(&line, line_no)?;
                if feature.pfam.is_none() && pfam_type.is_match(&feature.feature_type) {
                    feature.pfam = Some(feature.feature_type.clone());
                    pfam_from_type += 1;
                }
                stmt.execute(params![
                    feature.seqid,
                    feature.source,
                    feature.feature_type,
                    feature.start,
                    feature.end,
                    feature.score,
                    feature.strand,
                    feature.phase,
                    feature.attributes,
                    feature.id,
                    feature.product,
                    feature.ec_number,
                    feature.pfam,
                    feature.cog,
                    feature.ko,
                    feature.tigrfam,
                    feature.smart,
                    feature.cath_funfam,
                    feature.superfamily,
                    feature.product_source,
                ])?;
                loaded += 1;
            }
        }
        tx.commit()?;

        if pfam_from_type > 0 {
            info!(count = pfam_from_type, "features with PFAM id in type column");
        }
        info!(features = loaded, "parsed GFF features");
        Ok(Self {
            conn,
            path: Utf8PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn query_by_ec(&self, pattern: &str) -> Result<Vec<GffFeature>, NmdcError> {
        self.query_like("ec_number", pattern)
    }

    pub fn query_by_pfam(&self, pfam_id: &str) -> Result<Vec<GffFeature>, NmdcError> {
        self.query_like("pfam", pfam_id)
    }

    pub fn query_by_cog(&self, cog_id: &str) -> Result<Vec<GffFeature>, NmdcError> {
        self.query_like("cog", cog_id)
    }

    pub fn query_by_ko(&self, ko_id: &str) -> Result<Vec<GffFeature>, NmdcError> {
        self.query_like("ko", ko_id)
    }

    /// Substring match; `%` and `_` in `pattern` keep their LIKE meaning.
    fn query_like(&self, column: &str, pattern: &str) -> Result<Vec<GffFeature>, NmdcError> {
        let sql = format!("{SELECT_FEATURES} WHERE {column} LIKE '%' || ?1 || '%' ORDER BY rowid");
        self.select(&sql, params![pattern])
    }

    /// Features overlapping `[start, end]` (1-based, inclusive).
    pub fn query_region(
        &self,
        seqid: &str,
        start: i64,
        end: i64,
        feature_type: Option<&str>,
    ) -> Result<Vec<GffFeature>, NmdcError> {
        let sql = format!(
            r#"{SELECT_FEATURES} WHERE seqid = ?1 AND start <= ?3 AND "end" >= ?2
               AND (?4 IS NULL OR type = ?4) ORDER BY start, rowid"#
        );
        self.select(&sql, params![seqid, start, end, feature_type])
    }

    /// Runs arbitrary SQL against `features`, one JSON object per row.
    pub fn query_sql(&self, sql: &str) -> Result<Vec<Map<String, Value>>, NmdcError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let rows = stmt.query_map([], |row| {
            let mut record = Map::new();
            for (index, name) in columns.iter().enumerate() {
                let value = match row.get_ref(index)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(number) => Value::from(number),
                    ValueRef::Real(number) => Value::from(number),
                    ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
                    ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
                };
                record.insert(name.clone(), value);
            }
            Ok(record)
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(rows = records.len(), "custom GFF query");
        Ok(records)
    }

    /// Groups CDS features into clusters of at least `min_genes` whose
    /// neighbouring genes lie at most `max_distance` bp apart. With
    /// `required_annotations`, only genes carrying at least one of the named
    /// annotation columns take part.
    pub fn find_bgc_candidates(
        &self,
        min_genes: usize,
        max_distance: i64,
        required_annotations: &[String],
    ) -> Result<Vec<BgcCandidate>, NmdcError> {
        for column in required_annotations {
            if !ATTRIBUTE_COLUMNS.contains(&column.as_str()) {
                return Err(NmdcError::InvalidArgument(format!(
                    "unknown annotation column '{column}'"
                )));
            }
        }

        let cds = self.select(
            &format!("{SELECT_FEATURES} WHERE type = 'CDS' ORDER BY seqid, start, rowid"),
            [],
        )?;

        let mut clusters = Vec::new();
        let mut current: Vec<GffFeature> = Vec::new();
        let mut flush = |current: &mut Vec<GffFeature>| {
            if current.len() >= min_genes.max(1) {
                if let Some(candidate) = BgcCandidate::from_genes(current) {
                    clusters.push(candidate);
                }
            }
            current.clear();
        };

        for gene in cds {
            if !required_annotations.is_empty()
                && !required_annotations
                    .iter()
                    .any(|column| gene.annotation(column).is_some())
            {
                continue;
            }
            let extends = current
                .last()
                .is_some_and(|last| last.seqid == gene.seqid && gene.start - last.end <= max_distance);
            if !extends {
                flush(&mut current);
            }
            current.push(gene);
        }
        flush(&mut current);

        info!(count = clusters.len(), "found BGC candidates");
        Ok(clusters)
    }

    pub fn summary_stats(&self) -> Result<GffSummary, NmdcError> {
        let count = |sql: &str| -> Result<u64, NmdcError> {
            let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value.max(0) as u64)
        };

        let mut feature_types = BTreeMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT type, COUNT(*) FROM features GROUP BY type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (kind, total) = row?;
                feature_types.insert(kind, total.max(0) as u64);
            }
        }

        let sequences = {
            let mut stmt = self
                .conn
                .prepare("SELECT seqid FROM features GROUP BY seqid ORDER BY MIN(rowid)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(GffSummary {
            total_features: count("SELECT COUNT(*) FROM features")?,
            feature_types,
            sequences,
            has_ec: count("SELECT COUNT(*) FROM features WHERE ec_number IS NOT NULL")?,
            has_pfam: count("SELECT COUNT(*) FROM features WHERE pfam IS NOT NULL")?,
            has_cog: count("SELECT COUNT(*) FROM features WHERE cog IS NOT NULL")?,
            has_ko: count("SELECT COUNT(*) FROM features WHERE ko IS NOT NULL")?,
        })
    }

    pub fn all_features(&self) -> Result<Vec<GffFeature>, NmdcError> {
        self.select(&format!("{SELECT_FEATURES} ORDER BY rowid"), [])
    }

    fn select(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<GffFeature>, NmdcError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, feature_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

/// Writes features as TSV, restricted to `columns` when given.
pub fn export_tsv(
    features: &[GffFeature],
    path: &Utf8Path,
    columns: Option<&[String]>,
) -> Result<(), NmdcError> {
    let columns: Vec<&str> = match columns {
        Some(wanted) if !wanted.is_empty() => {
            for column in wanted {
                if !FEATURE_COLUMNS.contains(&column.as_str()) {
                    return Err(NmdcError::InvalidArgument(format!(
                        "unknown GFF column '{column}'"
                    )));
                }
            }
            wanted.iter().map(String::as_str).collect()
        }
        _ => FEATURE_COLUMNS.to_vec(),
    };

    let mut out = columns.join("\t");
    out.push('\n');
    for feature in features {
        let cells: Vec<String> = columns.iter().map(|column| feature.cell(column)).collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())?;
    info!(path = %path, rows = features.len(), "exported GFF features");
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), NmdcError> {
    conn.execute_batch(
        r#"
        CREATE TABLE features (
            seqid TEXT NOT NULL,
            source TEXT NOT NULL,
            type TEXT NOT NULL,
            start INTEGER NOT NULL,
            "end" INTEGER NOT NULL,
            score REAL,
            strand TEXT NOT NULL,
            phase TEXT NOT NULL,
            attributes TEXT NOT NULL,
            ID TEXT,
            product TEXT,
            ec_number TEXT,
            pfam TEXT,
            cog TEXT,
            ko TEXT,
            tigrfam TEXT,
            smart TEXT,
            cath_funfam TEXT,
            superfamily TEXT,
            product_source TEXT
        );
        CREATE INDEX idx_features_seqid_start ON features(seqid, start);
        "#,
    )?;
    Ok(())
}

/// `key=value` pairs separated by `;`; items without `=` are skipped.
pub fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .map(str::trim)
        .filter_map(|item| item.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn parse_line(line: &str, line_no: usize) -> Result<GffFeature, NmdcError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 9 {
        return Err(NmdcError::GffParse {
            line: line_no,
            message: format!("expected 9 tab-separated columns, found {}", fields.len()),
        });
    }
    let position = |raw: &str, name: &str| -> Result<i64, NmdcError> {
        raw.trim().parse::<i64>().map_err(|_| NmdcError::GffParse {
            line: line_no,
            message: format!("invalid {name} position '{raw}'"),
        })
    };
    let score = match fields[5].trim() {
        "." | "" => None,
        raw => Some(raw.parse::<f64>().map_err(|_| NmdcError::GffParse {
            line: line_no,
            message: format!("invalid score '{raw}'"),
        })?),
    };

    let mut attributes = parse_attributes(fields[8]);
    let mut take = |key: &str| attributes.remove(key).filter(|value| !value.is_empty());

    Ok(GffFeature {
        seqid: fields[0].to_string(),
        source: fields[1].to_string(),
        feature_type: fields[2].to_string(),
        start: position(fields[3], "start")?,
        end: position(fields[4], "end")?,
        score,
        strand: fields[6].to_string(),
        phase: fields[7].to_string(),
        attributes: fields[8].to_string(),
        id: take("ID"),
        product: take("product"),
        ec_number: take("ec_number"),
        pfam: take("pfam"),
        cog: take("cog"),
        ko: take("ko"),
        tigrfam: take("tigrfam"),
        smart: take("smart"),
        cath_funfam: take("cath_funfam"),
        superfamily: take("superfamily"),
        product_source: take("product_source"),
    })
}

fn feature_from_row(row: &Row<'_>) -> rusqlite::Result<GffFeature> {
    Ok(GffFeature {
        seqid: row.get(0)?,
        source: row.get(1)?,
        feature_type: row.get(2)?,
        start: row.get(3)?,
        end: row.get(4)?,
        score: row.get(5)?,
        strand: row.get(6)?,
        phase: row.get(7)?,
        attributes: row.get(8)?,
        id: row.get(9)?,
        product: row.get(10)?,
        ec_number: row.get(11)?,
        pfam: row.get(12)?,
        cog: row.get(13)?,
        ko: row.get(14)?,
        tigrfam: row.get(15)?,
        smart: row.get(16)?,
        cath_funfam: row.get(17)?,
        superfamily: row.get(18)?,
        product_source: row.get(19)?,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE: &str = "##gff-version 3\n\
c1\tprodigal\tCDS\t100\t400\t.\t+\t0\tID=g1;ec_number=EC:2.7.1.1;cog=COG0001\n\
c1\tprodigal\tCDS\t500\t900\t12.5\t-\t0\tID=g2;pfam=PF00005\n\
c1\thmmer\tPF00107\t950\t1200\t.\t+\t.\tID=g3\n\
c2\tprodigal\ttRNA\t10\t80\t.\t+\t.\tID=t1;product=tRNA-Ala\n";

    fn reader() -> GffReader {
        GffReader::from_reader(Cursor::new(SAMPLE)).unwrap()
    }

    #[test]
    fn attributes_split_on_first_equals() {
        let attrs = parse_attributes("ID=gene1; product=a=b ;junk");
        assert_eq!(attrs["ID"], "gene1");
        assert_eq!(attrs["product"], "a=b");
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn pfam_type_fills_pfam_column() {
        let hits = reader().query_by_pfam("PF00107").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_deref(), Some("g3"));
    }

    #[test]
    fn substring_and_region_queries() {
        let gff = reader();
        assert_eq!(gff.query_by_ec("2.7.").unwrap()[0].id.as_deref(), Some("g1"));
        assert_eq!(gff.query_by_cog("COG0001").unwrap().len(), 1);
        assert!(gff.query_by_ko("K00001").unwrap().is_empty());

        let region = gff.query_region("c1", 350, 600, None).unwrap();
        assert_eq!(region.len(), 2);
        let cds = gff.query_region("c1", 1, 2000, Some("CDS")).unwrap();
        assert_eq!(cds.len(), 2);
    }

    #[test]
    fn bad_column_count_reports_line() {
        let err = GffReader::from_reader(Cursor::new("# header\nc1\tonly\tthree\n")).err();
        assert_matches!(err, Some(NmdcError::GffParse { line: 2, .. }));
    }

    #[test]
    fn summary_counts_annotations() {
        let summary = reader().summary_stats().unwrap();
        assert_eq!(summary.total_features, 4);
        assert_eq!(summary.feature_types["CDS"], 2);
        assert_eq!(summary.sequences, vec!["c1", "c2"]);
        assert_eq!(summary.has_pfam, 2);
        assert_eq!(summary.has_ec, 1);
    }

    #[test]
    fn sql_rows_become_json() {
        let rows = reader()
            .query_sql("SELECT ID, start FROM features WHERE seqid = 'c2'")
            .unwrap();
        assert_eq!(rows[0]["ID"], "t1");
        assert_eq!(rows[0]["start"], 10);
    }
}
