use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use nmdc_link_toolkit::app::{
    App, CollectionKind, EnrichRequest, FunctionSearchRequest, GffSelector, LinkRequest,
    ProgressSink, Relation, SearchRequest, save_records,
};
use nmdc_link_toolkit::collection::Record;
use nmdc_link_toolkit::config::{ApiEnvironment, ClientConfig, default_cache_path};
use nmdc_link_toolkit::domain::{Direction, EdgeDirection};
use nmdc_link_toolkit::enrichment::{FdrMethod, Grouping, export_enrichment};
use nmdc_link_toolkit::error::NmdcError;
use nmdc_link_toolkit::export::ExportFormat;
use nmdc_link_toolkit::filter::BoundingBox;
use nmdc_link_toolkit::fs_util::write_atomic;
use nmdc_link_toolkit::functional_search::{DEFAULT_LIMIT, MatchLogic};
use nmdc_link_toolkit::linked_instances::DEFAULT_PAGE_SIZE;
use nmdc_link_toolkit::output::{HumanOutput, JsonOutput, OutputMode};
use nmdc_link_toolkit::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "nmdc")]
#[command(about = "Search the NMDC API, traverse linked instances and cache relationships locally")]
#[command(version)]
struct Cli {
    /// API environment; defaults to NMDC_ENV, then prod.
    #[arg(long, value_enum, global = true)]
    env: Option<ApiEnvironment>,

    /// Link cache database; defaults to NMDC_LINK_CACHE, then ~/.nmdc/links.db.
    #[arg(long, global = true)]
    cache: Option<Utf8PathBuf>,

    /// Print command results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search and retrieve biosample records")]
    Biosample(BiosampleArgs),
    #[command(about = "Search and retrieve study records")]
    Study(StudyArgs),
    #[command(about = "Search and retrieve data object records")]
    DataObject(DataObjectArgs),
    #[command(about = "Show which collection an NMDC id belongs to")]
    CollectionName(CollectionNameArgs),
    #[command(about = "Search biosamples by functional annotation (PFAM, KEGG, COG, GO)")]
    SearchByFunction(SearchByFunctionArgs),
    #[command(about = "Find objects linked to one or more NMDC ids")]
    Link(LinkArgs),
    #[command(about = "Fetch links from the API into the local cache")]
    CacheLinks(CacheLinksArgs),
    #[command(about = "Query cached links for an NMDC id")]
    QueryLinks(QueryLinksArgs),
    #[command(about = "Show link cache statistics")]
    CacheStats,
    #[command(about = "Clear the link cache")]
    CacheClear(CacheClearArgs),
    #[command(about = "Query GFF functional annotation files")]
    Gff(GffArgs),
    #[command(about = "Enrichment of annotations between two sample groups")]
    Enrich(EnrichArgs),
}

#[derive(Args, Clone)]
struct SearchArgs {
    #[arg(long)]
    id: Option<String>,

    /// Filter in YAML (`ecosystem_category: Terrestrial`) or JSON.
    #[arg(long)]
    filter: Option<String>,

    #[arg(short, long, default_value_t = 10)]
    limit: u32,

    #[arg(short, long = "all")]
    all_pages: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Clone)]
struct OutputArgs {
    #[arg(short, long)]
    output: Option<Utf8PathBuf>,

    #[arg(long, value_enum, default_value_t = ExportFormat::Auto)]
    format: ExportFormat,
}

#[derive(Args)]
struct BiosampleArgs {
    #[command(flatten)]
    search: SearchArgs,

    /// min_lat,min_lon,max_lat,max_lon
    #[arg(long)]
    bbox: Option<BoundingBox>,

    #[arg(long, requires = "id")]
    get_studies: bool,

    #[arg(long, requires = "id", conflicts_with = "get_studies")]
    get_data_objects: bool,
}

#[derive(Args)]
struct StudyArgs {
    #[command(flatten)]
    search: SearchArgs,

    #[arg(long, requires = "id")]
    get_biosamples: bool,

    #[arg(long, requires = "id", conflicts_with = "get_biosamples")]
    get_data_objects: bool,
}

#[derive(Args)]
struct DataObjectArgs {
    #[command(flatten)]
    search: SearchArgs,

    #[arg(long, requires = "id")]
    get_biosample: bool,

    #[arg(long, requires = "id", conflicts_with = "get_biosample")]
    get_study: bool,

    #[arg(long, requires = "id", conflicts_with_all = ["get_biosample", "get_study"])]
    trace_provenance: bool,
}

#[derive(Args)]
struct CollectionNameArgs {
    id: String,
}

#[derive(Args)]
struct SearchByFunctionArgs {
    /// Function ids, e.g. PFAM:PF00005, KEGG.ORTHOLOGY:K00001, or bare PF00005, K00001
    #[arg(required = true)]
    function_ids: Vec<String>,

    #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
    limit: u32,

    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// Require every function (AND); the default.
    #[arg(long, conflicts_with = "any")]
    require_all: bool,

    /// Accept biosamples with any of the functions (OR).
    #[arg(long)]
    any: bool,

    #[arg(long)]
    show_activities: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct LinkArgs {
    #[arg(required = true)]
    ids: Vec<String>,

    /// Comma-separated types, e.g. nmdc:Study,nmdc:DataObject
    #[arg(short, long, value_delimiter = ',')]
    types: Vec<String>,

    #[arg(short, long, value_enum, default_value_t = Direction::Both)]
    direction: Direction,

    #[arg(long)]
    hydrate: bool,

    #[arg(short, long, default_value_t = DEFAULT_PAGE_SIZE)]
    limit: u32,

    /// List every node instead of grouping by type.
    #[arg(long)]
    flat: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct CacheLinksArgs {
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Args)]
struct QueryLinksArgs {
    id: String,

    #[arg(short, long, value_enum, default_value_t = EdgeDirection::Both)]
    direction: EdgeDirection,

    #[arg(short = 't', long = "type")]
    relationship_type: Option<String>,

    #[arg(short, long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CacheClearArgs {
    #[arg(long)]
    id: Option<String>,

    #[arg(short, long)]
    yes: bool,
}

#[derive(Args)]
struct GffArgs {
    #[command(subcommand)]
    command: GffCommand,
}

#[derive(Subcommand)]
enum GffCommand {
    #[command(about = "Query features by annotation, region or SQL")]
    Query(GffQueryArgs),
    #[command(about = "Summary statistics for a GFF file")]
    Stats(GffFileArgs),
    #[command(about = "Find biosynthetic gene cluster candidates")]
    FindBgc(FindBgcArgs),
    #[command(about = "Export features to TSV")]
    Export(GffExportArgs),
}

#[derive(Args)]
struct GffFileArgs {
    gff_file: Utf8PathBuf,

    #[arg(short, long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct GffQueryArgs {
    gff_file: Utf8PathBuf,

    #[arg(long)]
    ec: Option<String>,

    #[arg(long)]
    pfam: Option<String>,

    #[arg(long)]
    cog: Option<String>,

    #[arg(long)]
    ko: Option<String>,

    /// seqid:start-end
    #[arg(long)]
    region: Option<String>,

    #[arg(long = "type")]
    feature_type: Option<String>,

    #[arg(long)]
    sql: Option<String>,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(short, long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct FindBgcArgs {
    gff_file: Utf8PathBuf,

    #[arg(long, default_value_t = 5)]
    min_genes: usize,

    #[arg(long, default_value_t = 10_000)]
    max_distance: i64,

    /// Comma-separated annotation columns, e.g. pfam,ec_number
    #[arg(long, value_delimiter = ',')]
    require_annotations: Vec<String>,

    #[arg(short, long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct GffExportArgs {
    gff_file: Utf8PathBuf,
    output: Utf8PathBuf,

    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
}

#[derive(Args)]
struct EnrichArgs {
    /// Samples JSON file, or a study directory with biosample.json and GFF files.
    input: Utf8PathBuf,

    #[arg(long)]
    group_by: String,

    #[arg(long, default_value = "ec_number")]
    annotation_type: String,

    #[arg(long, conflicts_with_all = ["bins", "categories"])]
    threshold: Option<f64>,

    #[arg(long, conflicts_with = "categories")]
    bins: Option<u32>,

    #[arg(long, value_delimiter = ',')]
    categories: Vec<String>,

    #[arg(long, default_value = "benjamini-hochberg")]
    fdr_method: String,

    #[arg(long, default_value_t = 5)]
    min_count: u64,

    #[arg(long, default_value_t = 0.05)]
    alpha: f64,

    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<NmdcError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &NmdcError) -> u8 {
    match error {
        NmdcError::InvalidArgument(_)
        | NmdcError::InvalidEnvironment(_)
        | NmdcError::InvalidFilter(_)
        | NmdcError::IdsNotFound(_)
        | NmdcError::GffParse { .. } => 2,
        NmdcError::RemoteRequestFailed(_) | NmdcError::RemoteStatus { .. } => 3,
        NmdcError::Store(_) => 4,
        _ => 1,
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let env = match cli.env {
        Some(env) => env,
        None => ApiEnvironment::from_env()?,
    };
    let cache_path = match cli.cache {
        Some(path) => path,
        None => default_cache_path()?,
    };
    let transport = HttpTransport::new(&ClientConfig::for_env(env))?;
    let mut app = App::new(transport, cache_path);
    if let Some(config) = ClientConfig::data_for_env(env) {
        app = app.with_data_transport(HttpTransport::new(&config)?);
    }
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let sink: &dyn ProgressSink = match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &HumanOutput,
    };

    match cli.command {
        Commands::Biosample(args) => {
            let id = args.search.id.clone();
            let relation = match (args.get_studies, args.get_data_objects) {
                (true, _) => Some(Relation::BiosampleStudies),
                (_, true) => Some(Relation::BiosampleDataObjects),
                _ => None,
            };
            run_collection(
                &app,
                CollectionKind::Biosample,
                args.search,
                args.bbox,
                id.zip(relation),
                mode,
                sink,
            )
        }
        Commands::Study(args) => {
            let id = args.search.id.clone();
            let relation = match (args.get_biosamples, args.get_data_objects) {
                (true, _) => Some(Relation::StudyBiosamples),
                (_, true) => Some(Relation::StudyDataObjects),
                _ => None,
            };
            run_collection(&app, CollectionKind::Study, args.search, None, id.zip(relation), mode, sink)
        }
        Commands::DataObject(args) => {
            if args.trace_provenance {
                let id = args.search.id.unwrap_or_default();
                let result = app.provenance(&id, sink)?;
                if let Some(path) = &args.search.output.output {
                    write_json(path, &result.chain)?;
                    println!("Saved provenance chain to {path}");
                }
                return match mode {
                    OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                    OutputMode::Human => {
                        HumanOutput::print_provenance(&result);
                        Ok(())
                    }
                };
            }
            let id = args.search.id.clone();
            let relation = match (args.get_biosample, args.get_study) {
                (true, _) => Some(Relation::DataObjectBiosamples),
                (_, true) => Some(Relation::DataObjectStudies),
                _ => None,
            };
            run_collection(
                &app,
                CollectionKind::DataObject,
                args.search,
                None,
                id.zip(relation),
                mode,
                sink,
            )
        }
        Commands::CollectionName(args) => {
            let result = app.collection_name(&args.id)?;
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_collection_name(&result);
                    Ok(())
                }
            }
        }
        Commands::SearchByFunction(args) => {
            let request = FunctionSearchRequest {
                function_ids: args.function_ids,
                limit: args.limit,
                offset: args.offset,
                logic: if args.any && !args.require_all {
                    MatchLogic::Any
                } else {
                    MatchLogic::All
                },
            };
            let result = app.search_by_function(&request, sink)?;
            if let Some(path) = &args.output.output {
                return save(&result.results, path, args.output.format);
            }
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_function_search(&result, args.show_activities);
                    Ok(())
                }
            }
        }
        Commands::Link(args) => run_link(&app, args, mode, sink),
        Commands::CacheLinks(args) => {
            let result = app.cache_links(&args.ids, sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_cache_links(&result);
                    Ok(())
                }
            }
        }
        Commands::QueryLinks(args) => {
            let result =
                app.query_links(&args.id, args.direction, args.relationship_type.as_deref())?;
            if let Some(path) = &args.output {
                write_json(path, &result.links)?;
                println!("Saved {} links to {path}", result.links.len());
                return Ok(());
            }
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_query_links(&result);
                    Ok(())
                }
            }
        }
        Commands::CacheStats => {
            let stats = app.cache_stats()?;
            match mode {
                OutputMode::Json => JsonOutput::print_json(&stats).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_cache_stats(&stats);
                    Ok(())
                }
            }
        }
        Commands::CacheClear(args) => {
            if args.id.is_none() && !args.yes && !confirm("This will clear the entire link cache. Continue?")? {
                println!("Cancelled");
                return Ok(());
            }
            let result = app.cache_clear(args.id.as_deref())?;
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_clear(&result);
                    Ok(())
                }
            }
        }
        Commands::Gff(args) => run_gff(&app, args.command, mode, sink),
        Commands::Enrich(args) => run_enrich(&app, args, mode, sink),
    }
}

fn run_collection(
    app: &App<HttpTransport>,
    kind: CollectionKind,
    search: SearchArgs,
    bbox: Option<BoundingBox>,
    linked: Option<(String, Relation)>,
    mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    if let Some((id, relation)) = linked {
        let result = app.linked_records(&id, relation, sink)?;
        if let Some(path) = &search.output.output {
            return save(&result.records, path, search.output.format);
        }
        return match mode {
            OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
            OutputMode::Human => HumanOutput::print_linked_records(&result).into_diagnostic(),
        };
    }

    let request = SearchRequest {
        id: search.id,
        filter: search.filter,
        bbox,
        limit: search.limit,
        all_pages: search.all_pages,
    };
    let result = app.search(kind, &request, sink)?;
    if let Some(path) = &search.output.output {
        return save(&result.records, path, search.output.format);
    }
    match mode {
        OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_records(&result).into_diagnostic(),
    }
}

fn run_link(
    app: &App<HttpTransport>,
    args: LinkArgs,
    mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let request = LinkRequest {
        ids: args.ids,
        types: (!args.types.is_empty()).then_some(args.types),
        direction: args.direction,
        hydrate: args.hydrate,
        page_size: args.limit,
    };
    let result = app.link(&request, sink)?;

    if let Some(path) = &args.output.output {
        if args.flat {
            let records: Vec<Record> = result.nodes.iter().map(|node| node.to_record()).collect();
            return save(&records, path, args.output.format);
        }
        write_json(path, &result.by_type())?;
        println!("Saved grouped results to {path}");
        return Ok(());
    }
    match mode {
        OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_link(&result, !args.flat);
            Ok(())
        }
    }
}

fn run_gff(
    app: &App<HttpTransport>,
    command: GffCommand,
    mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    match command {
        GffCommand::Query(args) => {
            let selector = gff_selector(&args)?;
            let result = app.gff_query(&args.gff_file, &selector, args.limit, sink)?;
            if let Some(path) = &args.output {
                if result.rows.is_empty() {
                    nmdc_link_toolkit::gff::export_tsv(&result.features, path, None)?;
                } else {
                    save_records(&result.rows, path, ExportFormat::Tsv)?;
                }
                println!("Saved {} features to {path}", result.count);
                return Ok(());
            }
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_gff_query(&result).into_diagnostic(),
            }
        }
        GffCommand::Stats(args) => {
            let summary = app.gff_stats(&args.gff_file, sink)?;
            if let Some(path) = &args.output {
                write_json(path, &summary)?;
                println!("Saved statistics to {path}");
            }
            match mode {
                OutputMode::Json => JsonOutput::print_json(&summary).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_gff_stats(&summary);
                    Ok(())
                }
            }
        }
        GffCommand::FindBgc(args) => {
            let result = app.gff_find_bgc(
                &args.gff_file,
                args.min_genes,
                args.max_distance,
                &args.require_annotations,
                sink,
            )?;
            if let Some(path) = &args.output {
                write_json(path, &result.candidates)?;
                println!("Saved {} candidates to {path}", result.count);
                return Ok(());
            }
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print_bgc(&result);
                    Ok(())
                }
            }
        }
        GffCommand::Export(args) => {
            let columns = (!args.columns.is_empty()).then_some(args.columns.as_slice());
            let result = app.gff_export(&args.gff_file, &args.output, columns, sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
                OutputMode::Human => {
                    println!("Exported {} features to {}", result.features, result.output);
                    Ok(())
                }
            }
        }
    }
}

/// Only the first selector given is used; `--sql` wins over the rest.
fn gff_selector(args: &GffQueryArgs) -> Result<GffSelector, NmdcError> {
    if let Some(sql) = &args.sql {
        return Ok(GffSelector::Sql(sql.clone()));
    }
    if let Some(ec) = &args.ec {
        return Ok(GffSelector::Ec(ec.clone()));
    }
    if let Some(pfam) = &args.pfam {
        return Ok(GffSelector::Pfam(pfam.clone()));
    }
    if let Some(cog) = &args.cog {
        return Ok(GffSelector::Cog(cog.clone()));
    }
    if let Some(ko) = &args.ko {
        return Ok(GffSelector::Ko(ko.clone()));
    }
    if let Some(region) = &args.region {
        return parse_region(region, args.feature_type.clone());
    }
    Err(NmdcError::InvalidArgument(
        "specify one of --ec, --pfam, --cog, --ko, --region or --sql".to_string(),
    ))
}

fn parse_region(region: &str, feature_type: Option<String>) -> Result<GffSelector, NmdcError> {
    let invalid = || NmdcError::InvalidArgument(format!("invalid region '{region}', use seqid:start-end"));
    let (seqid, coords) = region.rsplit_once(':').ok_or_else(invalid)?;
    let (start, end) = coords.split_once('-').ok_or_else(invalid)?;
    Ok(GffSelector::Region {
        seqid: seqid.to_string(),
        start: start.trim().parse().map_err(|_| invalid())?,
        end: end.trim().parse().map_err(|_| invalid())?,
        feature_type,
    })
}

fn run_enrich(
    app: &App<HttpTransport>,
    args: EnrichArgs,
    mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let grouping = if !args.categories.is_empty() {
        Grouping::Categories(args.categories)
    } else if let Some(threshold) = args.threshold {
        Grouping::Threshold(threshold)
    } else if let Some(bins) = args.bins {
        Grouping::Bins(bins)
    } else {
        Grouping::Auto
    };
    let request = EnrichRequest {
        input: args.input,
        group_by: args.group_by,
        annotation_column: args.annotation_type,
        grouping,
        fdr: args.fdr_method.parse::<FdrMethod>()?,
        min_count: args.min_count,
        alpha: args.alpha,
    };
    let result = app.enrich(&request, sink)?;

    if let Some(path) = &args.output.output {
        let format = match args.output.format {
            ExportFormat::Auto if path.extension().is_none() => ExportFormat::Tsv,
            other => other,
        };
        export_enrichment(&result.results, path, format)?;
        println!("Saved results to {path}");
        return Ok(());
    }
    match mode {
        OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_enrichment(&result);
            Ok(())
        }
    }
}

fn save(records: &[Record], path: &Utf8Path, format: ExportFormat) -> miette::Result<()> {
    if records.is_empty() {
        println!("No results found.");
        return Ok(());
    }
    let used = save_records(records, path, format)?;
    println!("Saved {} record(s) to {path} ({used})", records.len());
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Utf8Path, value: &T) -> miette::Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}

fn confirm(prompt: &str) -> miette::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush().into_diagnostic()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).into_diagnostic()?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
