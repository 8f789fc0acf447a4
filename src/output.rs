use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use serde_json::Value;

use crate::app::{
    BgcResult, CacheLinksResult, ClearResult, CollectionNameResult, EnrichResult, GffQueryResult,
    LinkResult, LinkedRecordsResult, ProgressEvent, ProgressSink, ProvenanceResult,
    QueryLinksResult, RecordsResult,
};
use crate::collection::Record;
use crate::domain::{CacheStats, LinkedNode};
use crate::functional_search::FunctionSearchResult;
use crate::gff::GffSummary;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable summaries on stdout; progress goes to stderr.
pub struct HumanOutput;

impl ProgressSink for HumanOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{DIM}{} ({:.2}s){RESET}", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{DIM}{}{RESET}", event.message),
        }
    }
}

impl HumanOutput {
    pub fn print_records(result: &RecordsResult) -> io::Result<()> {
        print_record_preview(&result.records)
    }

    pub fn print_linked_records(result: &LinkedRecordsResult) -> io::Result<()> {
        println!("{GREEN}Found {} linked record(s) for {}{RESET}", result.count, result.id);
        if !result.by_type.is_empty() {
            println!("\nData objects by type:");
            for (kind, count) in &result.by_type {
                println!("  {kind}: {count} file(s)");
            }
        }
        print_record_preview(&result.records)
    }

    pub fn print_provenance(result: &ProvenanceResult) {
        println!("{GREEN}Found {} total entities in provenance chain of {}{RESET}\n", result.total, result.id);
        let chain = &result.chain;
        let buckets: [(&str, &[LinkedNode]); 6] = [
            ("biosamples", &chain.biosamples),
            ("studies", &chain.studies),
            ("workflow_executions", &chain.workflow_executions),
            ("data_generations", &chain.data_generations),
            ("processed_samples", &chain.processed_samples),
            ("data_objects", &chain.data_objects),
        ];
        for (name, nodes) in buckets {
            if nodes.is_empty() {
                continue;
            }
            println!("{CYAN}{name}:{RESET} {}", nodes.len());
            print_ids(nodes, 2);
        }
    }

    pub fn print_link(result: &LinkResult, group_by_type: bool) {
        println!("{GREEN}Found {} linked instance(s){RESET}", result.total);
        if !group_by_type {
            for node in &result.nodes {
                println!("  • {} ({})", node.id, node.type_name());
            }
            return;
        }
        let grouped = result.by_type();
        println!("\nResults by type:");
        for (kind, nodes) in &grouped {
            println!("  {CYAN}{kind}:{RESET} {}", nodes.len());
        }
        println!("\nSample entities:");
        for (kind, nodes) in &grouped {
            println!("\n{CYAN}{kind}:{RESET}");
            print_ids(nodes, 3);
        }
    }

    pub fn print_collection_name(result: &CollectionNameResult) {
        println!("{GREEN}{}{RESET} → {CYAN}{}{RESET}", result.id, result.collection_name);
    }

    pub fn print_function_search(result: &FunctionSearchResult, show_activities: bool) {
        let criteria = &result.search_criteria;
        println!("{GREEN}Found {} biosample(s) matching criteria{RESET}", result.count);
        println!("{CYAN}Function IDs:{RESET} {}", criteria.function_ids.join(", "));
        println!("{CYAN}Logic:{RESET} {}", criteria.logic);
        println!("{CYAN}Returned:{RESET} {} biosample(s)\n", result.results.len());
        if result.results.is_empty() {
            println!("{YELLOW}No biosamples found matching the criteria.{RESET}");
            println!("{DIM}Try adjusting your function IDs or using --any for OR logic{RESET}");
            return;
        }

        println!("biosample\tstudy\tactivities\tdata objects");
        for biosample in result.results.iter().take(20) {
            let activities = omics_activities(biosample);
            let outputs: usize = activities.iter().map(|activity| output_count(activity)).sum();
            println!(
                "{}\t{}\t{}\t{}",
                clip(str_field(biosample, "id"), 30),
                clip(str_field(biosample, "study_id"), 30),
                activities.len(),
                outputs
            );
        }
        if result.results.len() > 20 {
            println!("\n{DIM}... showing first 20 of {} biosamples{RESET}", result.results.len());
        }

        if !show_activities {
            return;
        }
        println!("\n{CYAN}Omics processing activities:{RESET}\n");
        for biosample in result.results.iter().take(5) {
            println!("{}", str_field(biosample, "id"));
            for activity in omics_activities(biosample) {
                println!("  • {}", activity.get("type").and_then(Value::as_str).unwrap_or("N/A"));
                println!("    ID: {}", activity.get("id").and_then(Value::as_str).unwrap_or("N/A"));
                println!("    Outputs: {} file(s)", output_count(activity));
            }
            println!();
        }
        if result.results.len() > 5 {
            println!("{DIM}... showing activities for first 5 of {} biosamples{RESET}", result.results.len());
        }
    }

    pub fn print_cache_links(result: &CacheLinksResult) {
        for entry in &result.entries {
            println!("{GREEN}✓ Cached {} links for {}{RESET}", entry.links, entry.id);
        }
        println!("\nTotal: {} links cached in {}", result.total, result.cache_path);
    }

    pub fn print_query_links(result: &QueryLinksResult) {
        if result.links.is_empty() {
            println!("{YELLOW}No cached links found for {}{RESET}", result.id);
            println!("{DIM}Run 'nmdc cache-links' to populate the cache{RESET}");
            return;
        }
        println!("Found {} cached link(s)\n", result.links.len());
        let mut by_type: BTreeMap<&str, Vec<_>> = BTreeMap::new();
        for link in &result.links {
            by_type.entry(&link.relationship_type).or_default().push(link);
        }
        for (kind, links) in by_type {
            println!("{CYAN}{kind}{RESET} ({} links)", links.len());
            for link in links.iter().take(5) {
                println!("  {} → {}", link.source_id, link.target_id);
            }
            if links.len() > 5 {
                println!("  {DIM}... and {} more{RESET}", links.len() - 5);
            }
            println!();
        }
    }

    pub fn print_cache_stats(stats: &CacheStats) {
        println!("Link cache statistics\n");
        println!("  Cache location: {CYAN}{}{RESET}", stats.cache_path);
        println!("  Total links: {GREEN}{}{RESET}", stats.total_edges);
        println!("  Entities cached: {GREEN}{}{RESET}", stats.total_synced_entities);
        if let Some(oldest) = stats.oldest_sync {
            println!("  Oldest sync: {oldest}");
        }
        if let Some(newest) = stats.newest_sync {
            println!("  Newest sync: {newest}");
        }
        if !stats.counts_by_relationship_type.is_empty() {
            println!("\nLinks by relationship type:\n");
            let mut counts: Vec<_> = stats.counts_by_relationship_type.iter().collect();
            counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (kind, count) in counts {
                println!("  {kind}: {CYAN}{count}{RESET}");
            }
        }
    }

    pub fn print_clear(result: &ClearResult) {
        match &result.entity_id {
            Some(id) => println!("{GREEN}✓ Cleared cache for {id} ({} links){RESET}", result.removed),
            None => println!("{GREEN}✓ Cleared entire link cache ({} links){RESET}", result.removed),
        }
    }

    pub fn print_gff_query(result: &GffQueryResult) -> io::Result<()> {
        println!("{GREEN}Found {} features{RESET}\n", result.count);
        if !result.rows.is_empty() {
            return print_record_preview(&result.rows);
        }
        println!("ID\tproduct\tEC\tPFAM\tseqid\tstart\tend");
        for feature in result.features.iter().take(20) {
            println!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                clip(feature.id.as_deref().unwrap_or(""), 50),
                clip(feature.product.as_deref().unwrap_or(""), 60),
                clip(feature.ec_number.as_deref().unwrap_or(""), 20),
                clip(feature.pfam.as_deref().unwrap_or(""), 20),
                clip(&feature.seqid, 50),
                feature.start,
                feature.end
            );
        }
        if result.features.len() > 20 {
            println!("\n{DIM}... showing first 20 of {} results{RESET}", result.features.len());
        }
        Ok(())
    }

    pub fn print_gff_stats(summary: &GffSummary) {
        println!("Total features: {GREEN}{}{RESET}", summary.total_features);
        println!("Sequences: {}", summary.sequences.len());
        println!("\nFeature types:");
        for (kind, count) in &summary.feature_types {
            println!("  {kind}: {count}");
        }
        println!("\nAnnotation coverage:");
        println!("  EC numbers: {}", summary.has_ec);
        println!("  PFAM: {}", summary.has_pfam);
        println!("  COG: {}", summary.has_cog);
        println!("  KO: {}", summary.has_ko);
    }

    pub fn print_bgc(result: &BgcResult) {
        println!("{GREEN}Found {} BGC candidate(s){RESET}\n", result.count);
        for (index, candidate) in result.candidates.iter().enumerate() {
            println!(
                "{CYAN}Cluster {}{RESET}: {}:{}-{} ({} genes, {} bp)",
                index + 1,
                candidate.seqid,
                candidate.start,
                candidate.end,
                candidate.gene_count,
                candidate.end - candidate.start
            );
        }
    }

    pub fn print_enrichment(result: &EnrichResult) {
        println!(
            "{GREEN}Found {} significant results (FDR < {}){RESET}",
            result.significant, result.alpha
        );
        println!("{DIM}Total features tested: {}{RESET}\n", result.tested);
        if result.significant == 0 {
            println!("{YELLOW}No significant enrichment found{RESET}");
            return;
        }
        println!("feature\tgroup1\tgroup2\tp-value\tFDR\tfold change\tenriched in");
        for item in result.significant_results().take(20) {
            println!(
                "{}\t{}/{}\t{}/{}\t{:.2e}\t{:.2e}\t{:.2}x\t{}",
                clip(&item.feature_id, 30),
                item.group1_count,
                item.group1_total,
                item.group2_count,
                item.group2_total,
                item.p_value,
                item.fdr,
                item.effect_size,
                item.enriched_in
            );
        }
        if result.significant > 20 {
            println!("\n{DIM}... showing top 20 of {} significant results{RESET}", result.significant);
        }
    }
}

fn str_field<'a>(record: &'a Record, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("N/A")
}

/// `omics_processing[].omics_data[]` entries of a portal biosample.
fn omics_activities(biosample: &Record) -> Vec<&Value> {
    let Some(Value::Array(processing)) = biosample.get("omics_processing") else {
        return Vec::new();
    };
    processing
        .iter()
        .filter_map(|omics| omics.get("omics_data").and_then(Value::as_array))
        .flatten()
        .collect()
}

fn output_count(activity: &Value) -> usize {
    activity
        .get("outputs")
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

fn print_ids(nodes: &[LinkedNode], shown: usize) {
    for node in nodes.iter().take(shown) {
        println!("  • {}", node.id);
    }
    if nodes.len() > shown {
        println!("  {DIM}... and {} more{RESET}", nodes.len() - shown);
    }
}

/// Pretty-prints the first three records.
fn print_record_preview(records: &[Record]) -> io::Result<()> {
    if records.is_empty() {
        println!("{YELLOW}No results found.{RESET}");
        return Ok(());
    }
    println!("Found {} record(s)\n", records.len());
    for (index, record) in records.iter().take(3).enumerate() {
        if index > 0 {
            println!("\n{}\n", "─".repeat(80));
        }
        JsonOutput::print_json(record)?;
    }
    if records.len() > 3 {
        println!("\n{DIM}... and {} more record(s){RESET}", records.len() - 3);
        println!("{DIM}Use --output with .json, .csv or .tsv to save results{RESET}");
    }
    Ok(())
}

fn clip(text: &str, width: usize) -> &str {
    match text.char_indices().nth(width) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
