use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;

use crate::biosample::BiosampleSearch;
use crate::collection::{CollectionSearch, Record, RecordQuery, collection_name};
use crate::data_object::{DataObjectSearch, ProvenanceChain};
use crate::domain::{CacheStats, CachedEdge, Direction, EdgeDirection, LinkedNode};
use crate::enrichment::{
    EnrichmentAnalyzer, EnrichmentResult, FdrMethod, Grouping, NoLabels, Samples, parse_samples,
    samples_from_gff,
};
use crate::error::NmdcError;
use crate::export::{ExportFormat, export_records};
use crate::filter::{BoundingBox, merge_filters, parse_filter};
use crate::fs_util::read_to_string;
use crate::functional_search::{FunctionSearchResult, FunctionalBiosampleSearch, MatchLogic};
use crate::gff::{BgcCandidate, GffFeature, GffReader, GffSummary, export_tsv};
use crate::link_cache::LinkCache;
use crate::linked_instances::{DEFAULT_PAGE_SIZE, LinkedInstancesSearch, TraversalQuery, group_by_type};
use crate::study::StudySearch;
use crate::transport::NmdcTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Biosample,
    Study,
    DataObject,
}

impl CollectionKind {
    pub fn collection_name(self) -> &'static str {
        match self {
            CollectionKind::Biosample => crate::biosample::BIOSAMPLE_COLLECTION,
            CollectionKind::Study => crate::study::STUDY_COLLECTION,
            CollectionKind::DataObject => crate::data_object::DATA_OBJECT_COLLECTION,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub id: Option<String>,
    pub filter: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub limit: u32,
    pub all_pages: bool,
}

/// Relationship lookups exposed by the collection commands. All of them
/// return hydrated documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    BiosampleStudies,
    BiosampleDataObjects,
    StudyBiosamples,
    StudyDataObjects,
    DataObjectBiosamples,
    DataObjectStudies,
}

#[derive(Debug, Clone)]
pub struct FunctionSearchRequest {
    pub function_ids: Vec<String>,
    pub limit: u32,
    pub offset: u32,
    pub logic: MatchLogic,
}

#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub ids: Vec<String>,
    pub types: Option<Vec<String>>,
    pub direction: Direction,
    pub hydrate: bool,
    pub page_size: u32,
}

/// Which features `gff query` selects. The feature type only narrows region
/// queries.
#[derive(Debug, Clone, PartialEq)]
pub enum GffSelector {
    Ec(String),
    Pfam(String),
    Cog(String),
    Ko(String),
    Region {
        seqid: String,
        start: i64,
        end: i64,
        feature_type: Option<String>,
    },
    Sql(String),
}

#[derive(Debug, Clone)]
pub struct EnrichRequest {
    pub input: Utf8PathBuf,
    pub group_by: String,
    pub annotation_column: String,
    pub grouping: Grouping,
    pub fdr: FdrMethod,
    pub min_count: u64,
    pub alpha: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordsResult {
    pub collection: String,
    pub count: usize,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkedRecordsResult {
    pub id: String,
    pub relation: Relation,
    pub count: usize,
    /// Data object counts per `data_object_type`; empty for other relations.
    pub by_type: BTreeMap<String, usize>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceResult {
    pub id: String,
    pub total: usize,
    pub chain: ProvenanceChain,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionNameResult {
    pub id: String,
    pub collection_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub ids: Vec<String>,
    pub direction: Direction,
    pub total: usize,
    pub nodes: Vec<LinkedNode>,
}

impl LinkResult {
    pub fn by_type(&self) -> BTreeMap<String, Vec<LinkedNode>> {
        group_by_type(&self.nodes)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedCount {
    pub id: String,
    pub links: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLinksResult {
    pub cache_path: String,
    pub entries: Vec<CachedCount>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryLinksResult {
    pub id: String,
    pub direction: EdgeDirection,
    pub relationship_type: Option<String>,
    pub links: Vec<CachedEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub entity_id: Option<String>,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GffQueryResult {
    pub path: String,
    pub count: usize,
    pub features: Vec<GffFeature>,
    /// Raw rows of a `--sql` query; `features` is empty then.
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BgcResult {
    pub path: String,
    pub count: usize,
    pub candidates: Vec<BgcCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GffExportResult {
    pub path: String,
    pub output: String,
    pub features: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichResult {
    pub group_by: String,
    pub samples: usize,
    pub tested: usize,
    pub alpha: f64,
    pub significant: usize,
    pub results: Vec<EnrichmentResult>,
}

impl EnrichResult {
    pub fn significant_results(&self) -> impl Iterator<Item = &EnrichmentResult> {
        self.results.iter().filter(|result| result.fdr < self.alpha)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: impl Into<String>, started: Option<Instant>) {
    sink.event(ProgressEvent {
        message: message.into(),
        elapsed: started.map(|started| started.elapsed()),
    });
}

/// Runs the CLI commands against one transport and one link cache file. The
/// data portal transport is optional; only functional search needs it.
#[derive(Clone)]
pub struct App<T: NmdcTransport + Clone> {
    transport: T,
    data_transport: Option<T>,
    cache_path: Utf8PathBuf,
}

impl<T: NmdcTransport + Clone> App<T> {
    pub fn new(transport: T, cache_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            transport,
            data_transport: None,
            cache_path: cache_path.into(),
        }
    }

    pub fn with_data_transport(mut self, transport: T) -> Self {
        self.data_transport = Some(transport);
        self
    }

    pub fn cache_path(&self) -> &Utf8Path {
        &self.cache_path
    }

    fn open_cache(&self) -> Result<LinkCache, NmdcError> {
        LinkCache::open(&self.cache_path)
    }

    pub fn search(
        &self,
        kind: CollectionKind,
        request: &SearchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RecordsResult, NmdcError> {
        let started = Instant::now();
        let search = CollectionSearch::new(self.transport.clone(), kind.collection_name());

        let records = match &request.id {
            Some(id) => {
                emit(sink, format!("fetching {id}"), None);
                vec![search.get_record_by_id(id, "")?]
            }
            None => {
                let mut filter = match request.filter.as_deref() {
                    Some(raw) => parse_filter(raw)?,
                    None => String::new(),
                };
                if let Some(bbox) = &request.bbox {
                    filter = if filter.is_empty() {
                        bbox.to_filter()
                    } else {
                        merge_filters(&filter, &bbox.to_filter())?
                    };
                }
                emit(sink, format!("searching {}", kind.collection_name()), None);
                search.get_records(
                    &RecordQuery::default()
                        .filter(filter)
                        .max_page_size(request.limit)
                        .all_pages(request.all_pages),
                )?
            }
        };

        emit(sink, format!("found {} record(s)", records.len()), Some(started));
        Ok(RecordsResult {
            collection: kind.collection_name().to_string(),
            count: records.len(),
            records,
        })
    }

    pub fn linked_records(
        &self,
        id: &str,
        relation: Relation,
        sink: &dyn ProgressSink,
    ) -> Result<LinkedRecordsResult, NmdcError> {
        let started = Instant::now();
        emit(sink, format!("finding linked records for {id}"), None);

        let nodes = match relation {
            Relation::BiosampleStudies => {
                BiosampleSearch::new(self.transport.clone()).linked_studies(id, true)?
            }
            Relation::BiosampleDataObjects => BiosampleSearch::new(self.transport.clone())
                .linked_data_objects(id, true, None)?,
            Relation::StudyBiosamples => {
                StudySearch::new(self.transport.clone()).linked_biosamples(id, true)?
            }
            Relation::StudyDataObjects => {
                StudySearch::new(self.transport.clone()).all_linked_data_objects(id, true)?
            }
            Relation::DataObjectBiosamples => {
                DataObjectSearch::new(self.transport.clone()).linked_biosamples(id, true)?
            }
            Relation::DataObjectStudies => {
                DataObjectSearch::new(self.transport.clone()).linked_studies(id, true)?
            }
        };

        let mut by_type = BTreeMap::new();
        if matches!(
            relation,
            Relation::BiosampleDataObjects | Relation::StudyDataObjects
        ) {
            for node in &nodes {
                let kind = node.payload_str("data_object_type").unwrap_or("Unknown");
                *by_type.entry(kind.to_string()).or_insert(0) += 1;
            }
        }

        let records: Vec<Record> = nodes.iter().map(LinkedNode::to_record).collect();
        emit(sink, format!("found {} linked record(s)", records.len()), Some(started));
        Ok(LinkedRecordsResult {
            id: id.to_string(),
            relation,
            count: records.len(),
            by_type,
            records,
        })
    }

    pub fn collection_name(&self, id: &str) -> Result<CollectionNameResult, NmdcError> {
        Ok(CollectionNameResult {
            id: id.to_string(),
            collection_name: collection_name(&self.transport, id)?,
        })
    }

    pub fn search_by_function(
        &self,
        request: &FunctionSearchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FunctionSearchResult, NmdcError> {
        let Some(transport) = &self.data_transport else {
            return Err(NmdcError::InvalidArgument(
                "functional search is only available for the prod and dev environments".to_string(),
            ));
        };
        let started = Instant::now();
        emit(
            sink,
            format!("searching biosamples with {} logic", request.logic),
            None,
        );
        let result = FunctionalBiosampleSearch::new(transport.clone()).search_by_functions(
            &request.function_ids,
            request.limit,
            request.offset,
            request.logic,
        )?;
        emit(
            sink,
            format!("found {} matching biosample(s)", result.count),
            Some(started),
        );
        Ok(result)
    }

    pub fn provenance(
        &self,
        data_object_id: &str,
        sink: &dyn ProgressSink,
    ) -> Result<ProvenanceResult, NmdcError> {
        let started = Instant::now();
        emit(sink, format!("tracing provenance of {data_object_id}"), None);
        let chain = DataObjectSearch::new(self.transport.clone())
            .provenance_chain(data_object_id, true)?;
        emit(sink, format!("{} entities upstream", chain.total()), Some(started));
        Ok(ProvenanceResult {
            id: data_object_id.to_string(),
            total: chain.total(),
            chain,
        })
    }

    /// `Both` returns the plain traversal; a single direction keeps only that
    /// bucket of the directional grouping.
    pub fn link(&self, request: &LinkRequest, sink: &dyn ProgressSink) -> Result<LinkResult, NmdcError> {
        let started = Instant::now();
        emit(
            sink,
            format!("finding linked instances for {} id(s)", request.ids.len()),
            None,
        );
        let search = LinkedInstancesSearch::new(self.transport.clone());

        let nodes = match request.direction {
            Direction::Both => {
                let mut query = TraversalQuery::new(request.ids.iter().cloned())
                    .hydrate(request.hydrate)
                    .page_size(request.page_size);
                if let Some(types) = &request.types {
                    query = query.types(types.iter().cloned());
                }
                search.traverse(&query)?
            }
            direction => {
                let mut groups = search.group_by(
                    &request.ids,
                    request.types.as_deref(),
                    direction,
                    request.hydrate,
                    request.page_size,
                )?;
                groups.remove(direction.as_str()).unwrap_or_default()
            }
        };

        emit(sink, format!("found {} linked instance(s)", nodes.len()), Some(started));
        Ok(LinkResult {
            ids: request.ids.clone(),
            direction: request.direction,
            total: nodes.len(),
            nodes,
        })
    }

    pub fn cache_links(
        &self,
        ids: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<CacheLinksResult, NmdcError> {
        if ids.is_empty() {
            return Err(NmdcError::InvalidArgument(
                "at least one id is required".to_string(),
            ));
        }
        let cache = self.open_cache()?;
        let search = LinkedInstancesSearch::new(self.transport.clone());

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let started = Instant::now();
            emit(sink, format!("fetching links for {id}"), None);
            let nodes = search.traverse(
                &TraversalQuery::new([id.as_str()])
                    .hydrate(false)
                    .page_size(DEFAULT_PAGE_SIZE),
            )?;
            let links = cache.cache_from_linked_instances(&nodes, id)?;
            emit(sink, format!("cached {links} links for {id}"), Some(started));
            entries.push(CachedCount {
                id: id.clone(),
                links,
            });
        }

        Ok(CacheLinksResult {
            cache_path: cache.path().to_string(),
            total: entries.iter().map(|entry| entry.links).sum(),
            entries,
        })
    }

    pub fn query_links(
        &self,
        id: &str,
        direction: EdgeDirection,
        relationship_type: Option<&str>,
    ) -> Result<QueryLinksResult, NmdcError> {
        let links = self
            .open_cache()?
            .query_edges(id, direction, relationship_type)?;
        Ok(QueryLinksResult {
            id: id.to_string(),
            direction,
            relationship_type: relationship_type.map(str::to_string),
            links,
        })
    }

    pub fn cache_stats(&self) -> Result<CacheStats, NmdcError> {
        self.open_cache()?.stats()
    }

    pub fn cache_clear(&self, entity_id: Option<&str>) -> Result<ClearResult, NmdcError> {
        let removed = self.open_cache()?.evict(entity_id)?;
        Ok(ClearResult {
            entity_id: entity_id.map(str::to_string),
            removed,
        })
    }

    pub fn gff_query(
        &self,
        path: &Utf8Path,
        selector: &GffSelector,
        limit: Option<usize>,
        sink: &dyn ProgressSink,
    ) -> Result<GffQueryResult, NmdcError> {
        let reader = load_gff(path, sink)?;
        let (mut features, mut rows) = match selector {
            GffSelector::Sql(sql) => (Vec::new(), reader.query_sql(sql)?),
            GffSelector::Ec(pattern) => (reader.query_by_ec(pattern)?, Vec::new()),
            GffSelector::Pfam(id) => (reader.query_by_pfam(id)?, Vec::new()),
            GffSelector::Cog(id) => (reader.query_by_cog(id)?, Vec::new()),
            GffSelector::Ko(id) => (reader.query_by_ko(id)?, Vec::new()),
            GffSelector::Region {
                seqid,
                start,
                end,
                feature_type,
            } => (
                reader.query_region(seqid, *start, *end, feature_type.as_deref())?,
                Vec::new(),
            ),
        };
        if let Some(limit) = limit {
            features.truncate(limit);
            rows.truncate(limit);
        }
        Ok(GffQueryResult {
            path: path.to_string(),
            count: features.len() + rows.len(),
            features,
            rows,
        })
    }

    pub fn gff_stats(&self, path: &Utf8Path, sink: &dyn ProgressSink) -> Result<GffSummary, NmdcError> {
        load_gff(path, sink)?.summary_stats()
    }

    pub fn gff_find_bgc(
        &self,
        path: &Utf8Path,
        min_genes: usize,
        max_distance: i64,
        required_annotations: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<BgcResult, NmdcError> {
        let candidates =
            load_gff(path, sink)?.find_bgc_candidates(min_genes, max_distance, required_annotations)?;
        Ok(BgcResult {
            path: path.to_string(),
            count: candidates.len(),
            candidates,
        })
    }

    pub fn gff_export(
        &self,
        path: &Utf8Path,
        output: &Utf8Path,
        columns: Option<&[String]>,
        sink: &dyn ProgressSink,
    ) -> Result<GffExportResult, NmdcError> {
        let features = load_gff(path, sink)?.all_features()?;
        export_tsv(&features, output, columns)?;
        Ok(GffExportResult {
            path: path.to_string(),
            output: output.to_string(),
            features: features.len(),
        })
    }

    /// `input` is either a samples JSON file or a study directory laid out as
    /// `nmdc_bsm-*/biosample.json` with `*/data_objects/*_functional_annotation.gff`.
    pub fn enrich(
        &self,
        request: &EnrichRequest,
        sink: &dyn ProgressSink,
    ) -> Result<EnrichResult, NmdcError> {
        let started = Instant::now();
        emit(sink, format!("loading samples from {}", request.input), None);
        let samples = if request.input.is_dir() {
            load_study_dir(&request.input, &request.annotation_column)?
        } else {
            parse_samples(&read_to_string(&request.input)?)?
        };
        if samples.len() < 2 {
            return Err(NmdcError::Enrichment(format!(
                "need at least 2 samples, found {}",
                samples.len()
            )));
        }

        let analyzer = EnrichmentAnalyzer::new(request.fdr, request.min_count, NoLabels);
        let results = analyzer.analyze(&samples, &request.group_by, &request.grouping)?;
        let significant = results
            .iter()
            .filter(|result| result.fdr < request.alpha)
            .count();
        emit(
            sink,
            format!("{significant} significant of {} tested", results.len()),
            Some(started),
        );
        Ok(EnrichResult {
            group_by: request.group_by.clone(),
            samples: samples.len(),
            tested: results.len(),
            alpha: request.alpha,
            significant,
            results,
        })
    }
}

fn load_gff(path: &Utf8Path, sink: &dyn ProgressSink) -> Result<GffReader, NmdcError> {
    let started = Instant::now();
    emit(sink, format!("loading GFF file {path}"), None);
    let reader = GffReader::open(path)?;
    emit(sink, "GFF loaded", Some(started));
    Ok(reader)
}

fn load_study_dir(dir: &Utf8Path, annotation_column: &str) -> Result<Samples, NmdcError> {
    let mut biosamples = Vec::new();
    let mut gff_files = BTreeMap::new();

    for entry in read_dir(dir)? {
        let name = entry.file_name().unwrap_or_default().to_string();
        if !entry.is_dir() || !name.starts_with("nmdc_bsm-") {
            continue;
        }
        let biosample_file = entry.join("biosample.json");
        if biosample_file.is_file() {
            let body: Value = serde_json::from_str(&read_to_string(&biosample_file)?)
                .map_err(|err| NmdcError::ConfigParse(format!("{biosample_file}: {err}")))?;
            if let Value::Object(record) = body {
                biosamples.push(record);
            }
        }

        let data_objects = entry.join("data_objects");
        if data_objects.is_dir() {
            let biosample_id = name.replacen("nmdc_", "nmdc:", 1);
            for file in read_dir(&data_objects)? {
                if file.as_str().ends_with("_functional_annotation.gff") {
                    gff_files.insert(biosample_id.clone(), file);
                }
            }
        }
    }

    if biosamples.is_empty() {
        return Err(NmdcError::Enrichment(format!(
            "no biosample.json files found in {dir}"
        )));
    }
    if gff_files.is_empty() {
        return Err(NmdcError::Enrichment(format!("no GFF files found in {dir}")));
    }
    samples_from_gff(&biosamples, &gff_files, annotation_column)
}

fn read_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, NmdcError> {
    let mut paths = Vec::new();
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| NmdcError::Filesystem(format!("read {dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| NmdcError::Filesystem(format!("read {dir}: {err}")))?;
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Exports command records to `output`, flattening for delimited formats.
pub fn save_records(
    records: &[Record],
    output: &Utf8Path,
    format: ExportFormat,
) -> Result<ExportFormat, NmdcError> {
    export_records(records, output, format, true)
}
