use chrono::prelude::*;
use clap::Parser;
use flate2::read::MultiGzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use plotters::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 1000 Genomes phase 3 integrated SV map, lifted to GRCh38 positions
const SV_VCF_URL: &str = "https://ftp.1000genomes.ebi.ac.uk/vol1/ftp/phase3/integrated_sv_map/supporting/GRCh38_positions/ALL.wgs.integrated_sv_map_v2_GRCh38.20130502.svs.genotypes.vcf.gz";

/// Command-line arguments
#[derive(Parser)]
#[command(
    name = "svscan",
    about = "Scan the 1000 Genomes structural variant map for variants overlapping nutrition gene regions (GRCh38)"
)]
struct Args {
    /// Directory for downloaded data and result artifacts
    #[arg(short, long, value_name = "DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Structural variant types to keep (comma separated)
    #[arg(
        short = 't',
        long,
        value_name = "TYPES",
        value_delimiter = ',',
        default_value = "DEL,DUP"
    )]
    sv_types: Vec<String>,

    /// Stop scanning after this many variant lines
    #[arg(long, value_name = "N")]
    max_records: Option<u64>,

    /// Keep every type match regardless of gene regions
    #[arg(long)]
    no_region_filter: bool,

    /// Use an existing uncompressed VCF instead of downloading
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,
}

/// Custom error type for downloads
#[derive(Debug)]
enum DownloadError {
    Io(std::io::Error),
    Reqwest(reqwest::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Io(e) => write!(f, "IO error: {e}"),
            DownloadError::Reqwest(e) => write!(f, "Reqwest error: {e}"),
        }
    }
}
impl Error for DownloadError {}
impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Io(e)
    }
}
impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Reqwest(e)
    }
}

/// Download a remote file to disk with a progress bar. The client carries a
/// 60 second network timeout; the rest of the pipeline has none.
fn download_file(url: &str, out_path: &Path, log_file: &mut File) -> Result<(), DownloadError> {
    println!("  -> Starting download from {url}");
    writeln!(log_file, "  -> Starting download from {url}")?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let mut response = client.get(url).send()?.error_for_status()?;
    let total_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|s| s.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("=>-"),
    );

    let mut file = File::create(out_path)?;
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = response.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        pb.set_position(downloaded);
    }
    pb.finish_with_message("Download complete");
    Ok(())
}

/// Make sure the SV genotypes archive exists locally and decompresses,
/// re-downloading it when missing or corrupt.
fn ensure_sv_vcf(gz_path: &Path, log_file: &mut File) -> Result<(), Box<dyn Error>> {
    if !gz_path.exists() {
        println!("  -> Missing SV genotypes archive, downloading...");
        writeln!(log_file, "  -> Missing SV genotypes archive, downloading...")?;
        download_file(SV_VCF_URL, gz_path, log_file)?;
        return Ok(());
    }

    println!("  -> Found local SV genotypes archive: {}", gz_path.display());
    writeln!(
        log_file,
        "  -> Found local SV genotypes archive: {}",
        gz_path.display()
    )?;
    let testf = File::open(gz_path)?;
    let mut test_decoder = MultiGzDecoder::new(testf);
    let mut buffer = [0u8; 1024];
    if let Err(e) = test_decoder.read(&mut buffer) {
        println!("  -> Archive is corrupt ({e}), re-downloading...");
        writeln!(log_file, "  -> Archive is corrupt ({e}), re-downloading...")?;
        fs::remove_file(gz_path)?;
        download_file(SV_VCF_URL, gz_path, log_file)?;
    }
    Ok(())
}

/// Decompress the gzipped archive to a plain text VCF
fn decompress_vcf(gz_path: &Path, vcf_path: &Path, log_file: &mut File) -> Result<(), Box<dyn Error>> {
    println!("[STEP] Decompressing archive to: {}", vcf_path.display());
    writeln!(
        log_file,
        "[STEP] Decompressing archive to: {}",
        vcf_path.display()
    )?;
    let file = File::open(gz_path)?;
    let mut decoder = MultiGzDecoder::new(file);
    let mut out = File::create(vcf_path)?;
    std::io::copy(&mut decoder, &mut out)?;
    Ok(())
}

/// Walk the decompressed VCF once and record its basic shape: line counts,
/// the #CHROM column names, and the file size.
fn explore_vcf(vcf_path: &Path, summary_path: &Path, log_file: &mut File) -> Result<(), Box<dyn Error>> {
    println!("[STEP] Exploring VCF file: {}", vcf_path.display());
    writeln!(log_file, "[STEP] Exploring VCF file: {}", vcf_path.display())?;

    let file = File::open(vcf_path)?;
    let reader = BufReader::new(file);

    let mut total_lines: u64 = 0;
    let mut header_lines: u64 = 0;
    let mut variant_lines: u64 = 0;
    let mut columns: Vec<String> = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        total_lines += 1;
        if line.starts_with('#') {
            header_lines += 1;
            if line.starts_with("#CHROM") {
                columns = line.trim().split('\t').map(|s| s.to_string()).collect();
            }
        } else {
            variant_lines += 1;
        }
    }

    let size_mb = fs::metadata(vcf_path)?.len() as f64 / (1024.0 * 1024.0);

    let mut out = File::create(summary_path)?;
    writeln!(out, "=== VCF File Summary ===")?;
    writeln!(out, "File path: {}", vcf_path.display())?;
    writeln!(out, "Size: {:.2} MB", size_mb)?;
    writeln!(out, "Total lines: {}", total_lines)?;
    writeln!(out, "Header lines: {}", header_lines)?;
    writeln!(out, "Variant rows: {}", variant_lines)?;
    writeln!(out, "Columns ({} total):", columns.len())?;
    for column in &columns {
        writeln!(out, "{}", column)?;
    }

    println!("  -> File summary saved to {}", summary_path.display());
    writeln!(
        log_file,
        "  -> File summary saved to {}",
        summary_path.display()
    )?;
    Ok(())
}

/// A gene region of interest, closed interval on one chromosome
#[derive(Debug, Clone)]
struct GeneRegion {
    gene: String,
    chrom: String,
    start: u64,
    end: u64,
}

impl GeneRegion {
    fn new(gene: &str, chrom: &str, start: u64, end: u64) -> Self {
        GeneRegion {
            gene: gene.to_string(),
            chrom: chrom.to_string(),
            start,
            end,
        }
    }
}

/// Nutrition and metabolism genes scanned by default (GRCh38 coordinates,
/// padded by 100 kb on each side). Definition order decides which gene a
/// variant is credited to when several regions overlap it.
fn default_gene_regions() -> Vec<GeneRegion> {
    const PAD: u64 = 100_000;
    [
        ("TCF7L2", "10", 112_950_000u64, 113_300_000u64),
        ("GCK", "7", 44_140_000, 44_180_000),
        ("PCK1", "20", 57_400_000, 57_440_000),
        ("G6PC", "17", 42_900_000, 42_930_000),
        ("PDK4", "7", 95_000_000, 95_030_000),
        ("FASN", "17", 82_000_000, 82_050_000),
        ("PPARGC1A", "4", 233_800_000, 233_900_000),
        ("HMGCS2", "1", 119_700_000, 119_750_000),
        ("LCT", "2", 135_787_000, 135_837_000),
    ]
    .into_iter()
    .map(|(gene, chrom, start, end)| GeneRegion::new(gene, chrom, start - PAD, end + PAD))
    .collect()
}

fn region_names(regions: &[GeneRegion]) -> String {
    regions
        .iter()
        .map(|r| r.gene.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One structural variant kept by the scan. String fields hold the raw VCF
/// text; END already falls back to POS when the annotation is absent.
#[derive(Debug, Clone)]
struct SvRecord {
    chrom: String,
    pos: u64,
    end: u64,
    sv_type: String,
    sv_len: String,
    af_sas: String,
    af_eur: String,
    af_afr: String,
    gene: Option<String>,
    info: String,
}

/// Custom error to unify I/O and numeric failures while scanning the VCF
#[derive(Debug)]
enum ScanError {
    Io(std::io::Error),
    Parse(std::num::ParseIntError),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Io(e) => write!(f, "IO error during VCF scan: {}", e),
            ScanError::Parse(e) => write!(f, "Parse error during VCF scan: {}", e),
        }
    }
}
impl Error for ScanError {}
impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Io(e)
    }
}
impl From<std::num::ParseIntError> for ScanError {
    fn from(e: std::num::ParseIntError) -> Self {
        ScanError::Parse(e)
    }
}

/// Parse the semicolon-delimited INFO field into a HashMap. Flag entries
/// without '=' are ignored; the last occurrence of a duplicate key wins.
fn parse_info_field(info_str: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for item in info_str.split(';') {
        if let Some((key, value)) = item.split_once('=') {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Cap the raw INFO text at 200 characters, marking the cut
fn truncate_info(info: &str) -> String {
    if info.chars().count() > 200 {
        let head: String = info.chars().take(200).collect();
        format!("{head}...")
    } else {
        info.to_string()
    }
}

/// Parse one tab-delimited variant line. Lines with fewer than 9 columns are
/// skipped silently; a malformed POS or END aborts the scan.
fn parse_sv_line(line: &str) -> Result<Option<SvRecord>, ScanError> {
    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() < 9 {
        return Ok(None);
    }

    let chrom = columns[0].to_string();
    let pos: u64 = columns[1].parse()?;
    let info = columns[7];

    let info_map = parse_info_field(info);
    let sv_type = info_map
        .get("SVTYPE")
        .cloned()
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let sv_len = info_map
        .get("SVLEN")
        .cloned()
        .unwrap_or_else(|| "NA".to_string());
    let end: u64 = match info_map.get("END") {
        Some(value) => value.parse()?,
        None => pos,
    };
    let af_sas = info_map
        .get("SAS_AF")
        .cloned()
        .unwrap_or_else(|| "NA".to_string());
    let af_eur = info_map
        .get("EUR_AF")
        .cloned()
        .unwrap_or_else(|| "NA".to_string());
    let af_afr = info_map
        .get("AFR_AF")
        .cloned()
        .unwrap_or_else(|| "NA".to_string());

    Ok(Some(SvRecord {
        chrom,
        pos,
        end,
        sv_type,
        sv_len,
        af_sas,
        af_eur,
        af_afr,
        gene: None,
        info: truncate_info(info),
    }))
}

/// Return the first configured region on the same chromosome whose closed
/// interval overlaps [pos, end]. Definition order breaks ties.
fn find_overlapping_gene<'a>(
    regions: &'a [GeneRegion],
    chrom: &str,
    pos: u64,
    end: u64,
) -> Option<&'a GeneRegion> {
    regions
        .iter()
        .find(|r| r.chrom == chrom && pos <= r.end && end >= r.start)
}

/// Sort-key helper: allele frequency strings that do not parse count as 0.0.
/// The stored field keeps its original text.
fn numeric_or_zero(value: &str) -> f64 {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Scan configuration: accepted SV types, optional region table, optional cap
#[derive(Debug)]
struct ScanOptions {
    sv_types: Vec<String>,
    regions: Option<Vec<GeneRegion>>,
    max_records: Option<u64>,
}

/// Scan outcome: kept records in final sorted order plus the processed count
#[derive(Debug)]
struct SvScan {
    records: Vec<SvRecord>,
    processed: u64,
}

/// Single forward pass over the variant lines. Every non-blank, non-header
/// line counts as processed whether or not it is kept; the cap check runs
/// after the counter moves, so the line behind the limit stops the scan
/// before being parsed.
fn collect_sv_records(
    vcf_path: &Path,
    options: &ScanOptions,
    log_file: &mut File,
) -> Result<SvScan, ScanError> {
    if !vcf_path.exists() {
        return Err(ScanError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("VCF file not found: {}", vcf_path.display()),
        )));
    }

    println!("[STEP] Scanning VCF: {}", vcf_path.display());
    writeln!(log_file, "[STEP] Scanning VCF: {}", vcf_path.display())?;
    println!("  -> Keeping SV types: {}", options.sv_types.join(", "));
    writeln!(
        log_file,
        "  -> Keeping SV types: {}",
        options.sv_types.join(", ")
    )?;
    if let Some(regions) = &options.regions {
        println!("  -> Filtering for gene regions: {}", region_names(regions));
        writeln!(
            log_file,
            "  -> Filtering for gene regions: {}",
            region_names(regions)
        )?;
    }

    let file = File::open(vcf_path)?;
    let reader = BufReader::new(file);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} variant lines scanned")
            .unwrap(),
    );

    let mut processed: u64 = 0;
    let mut records: Vec<SvRecord> = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        processed += 1;
        pb.inc(1);
        if let Some(max) = options.max_records {
            if processed > max {
                println!("  -> Reached max_records limit ({})", max);
                writeln!(log_file, "  -> Reached max_records limit ({})", max)?;
                break;
            }
        }

        let mut record = match parse_sv_line(line)? {
            Some(record) => record,
            None => continue,
        };

        let matched = match &options.regions {
            Some(regions) => {
                find_overlapping_gene(regions, &record.chrom, record.pos, record.end)
                    .map(|region| region.gene.clone())
            }
            None => None,
        };

        if !options.sv_types.iter().any(|t| t == &record.sv_type) {
            continue;
        }
        if options.regions.is_some() && matched.is_none() {
            continue;
        }

        record.gene = matched;
        records.push(record);
    }
    pb.finish_and_clear();

    // Highest South Asian frequency first; stable for equal keys
    records.sort_by(|a, b| {
        numeric_or_zero(&b.af_sas)
            .partial_cmp(&numeric_or_zero(&a.af_sas))
            .unwrap_or(Ordering::Equal)
    });

    println!(
        "  -> Processed {} variant lines, kept {}.",
        processed,
        records.len()
    );
    writeln!(
        log_file,
        "  -> Processed {} variant lines, kept {}.",
        processed,
        records.len()
    )?;

    Ok(SvScan { records, processed })
}

const RESULT_COLUMNS: [&str; 10] = [
    "CHROM", "POS", "END", "SVTYPE", "SVLEN", "SAS_AF", "EUR_AF", "AFR_AF", "Gene", "INFO",
];

fn record_fields(record: &SvRecord) -> [String; 10] {
    [
        record.chrom.clone(),
        record.pos.to_string(),
        record.end.to_string(),
        record.sv_type.clone(),
        record.sv_len.clone(),
        record.af_sas.clone(),
        record.af_eur.clone(),
        record.af_afr.clone(),
        record.gene.clone().unwrap_or_else(|| "None".to_string()),
        record.info.clone(),
    ]
}

/// Write kept records as CSV, one row per variant, fields as stored
fn write_results_csv(records: &[SvRecord], csv_path: &Path) -> Result<(), Box<dyn Error>> {
    let mut wtr = csv::Writer::from_path(csv_path)?;
    wtr.write_record(RESULT_COLUMNS)?;
    for record in records {
        wtr.write_record(record_fields(record))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Render the first rows as an aligned text table
fn render_preview_table(records: &[SvRecord], limit: usize) -> String {
    let rows: Vec<[String; 10]> = records.iter().take(limit).map(record_fields).collect();
    let mut widths: Vec<usize> = RESULT_COLUMNS.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    for (i, header) in RESULT_COLUMNS.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(&format!("{:>width$}", header, width = widths[i]));
    }
    out.push('\n');
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            out.push_str(&format!("{:>width$}", cell, width = widths[i]));
        }
        out.push('\n');
    }
    out
}

/// Human-readable scan summary: settings, counts and a first-10 preview
fn write_scan_summary(
    scan: &SvScan,
    options: &ScanOptions,
    vcf_path: &Path,
    summary_path: &Path,
) -> std::io::Result<()> {
    let mut out = File::create(summary_path)?;
    writeln!(out, "=== Structural Variant Scan Summary ===")?;
    writeln!(out, "Date/Time: {}", Utc::now().to_rfc3339())?;
    writeln!(out)?;
    writeln!(out, "File: {}", vcf_path.display())?;
    writeln!(out, "Total variants processed: {}", scan.processed)?;
    writeln!(out, "Variants kept: {}", scan.records.len())?;
    writeln!(out, "SV types filtered: {}", options.sv_types.join(", "))?;
    if let Some(regions) = &options.regions {
        writeln!(out, "Gene regions searched: {}", region_names(regions))?;
    }
    writeln!(out)?;
    writeln!(out, "First 10 rows:")?;
    write!(out, "{}", render_preview_table(&scan.records, 10))?;
    Ok(())
}

/// The artifact written in place of the summary when nothing was kept
fn write_no_match_summary(summary_path: &Path) -> std::io::Result<()> {
    fs::write(summary_path, "No matching structural variants found.\n")
}

fn gene_label(record: &SvRecord) -> &str {
    record.gene.as_deref().unwrap_or("None")
}

const POPULATIONS: [&str; 3] = ["SAS", "EUR", "AFR"];

/// Horizontal grouped bars of mean allele frequency per gene for the three
/// populations. Frequencies that fail numeric parsing count as 0.0 here.
fn plot_population_frequencies(records: &[SvRecord], plot_path: &Path) -> Result<(), Box<dyn Error>> {
    if records.is_empty() {
        println!("  -> No data for plotting.");
        return Ok(());
    }

    let mut order: Vec<String> = Vec::new();
    let mut sums: HashMap<String, ([f64; 3], u32)> = HashMap::new();
    for record in records {
        let gene = gene_label(record).to_string();
        if !sums.contains_key(&gene) {
            order.push(gene.clone());
        }
        let entry = sums.entry(gene).or_insert(([0.0; 3], 0));
        entry.0[0] += numeric_or_zero(&record.af_sas);
        entry.0[1] += numeric_or_zero(&record.af_eur);
        entry.0[2] += numeric_or_zero(&record.af_afr);
        entry.1 += 1;
    }
    let means: Vec<(String, [f64; 3])> = order
        .iter()
        .map(|gene| {
            let (totals, n) = &sums[gene];
            let n = *n as f64;
            (gene.clone(), [totals[0] / n, totals[1] / n, totals[2] / n])
        })
        .collect();

    let gene_names: Vec<String> = means.iter().map(|(gene, _)| gene.clone()).collect();
    let max_af = means
        .iter()
        .flat_map(|(_, m)| m.iter().copied())
        .fold(0.0f64, f64::max);
    let x_max = (max_af * 1.15).max(0.01);

    let root = BitMapBackend::new(plot_path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            "Allele frequency of structural variants by population",
            ("sans-serif", 30),
        )
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(110)
        .build_cartesian_2d(0.0..x_max, 0.0..means.len() as f64)?;

    chart
        .configure_mesh()
        .disable_y_mesh()
        .x_desc("Allele frequency")
        .y_desc("Gene")
        .y_labels(gene_names.len())
        .y_label_formatter(&|y: &f64| {
            let idx = *y as usize;
            if (*y - idx as f64).abs() < f64::EPSILON {
                gene_names.get(idx).cloned().unwrap_or_default()
            } else {
                String::new()
            }
        })
        .draw()?;

    for (p, population) in POPULATIONS.iter().enumerate() {
        let bars: Vec<_> = means
            .iter()
            .enumerate()
            .map(|(i, (_, m))| {
                let y0 = i as f64 + 0.14 + p as f64 * 0.25;
                Rectangle::new([(0.0, y0), (m[p], y0 + 0.21)], Palette99::pick(p).filled())
            })
            .collect();
        chart
            .draw_series(bars)?
            .label(*population)
            .legend(move |(x, y)| {
                Rectangle::new([(x, y - 5), (x + 10, y + 5)], Palette99::pick(p).filled())
            });
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;

    println!("  -> Population frequency plot saved: {}", plot_path.display());
    Ok(())
}

/// Stacked histogram of absolute SV lengths by gene. Records without a
/// numeric SVLEN are left out of this plot only.
fn plot_sv_size_distribution(records: &[SvRecord], plot_path: &Path) -> Result<(), Box<dyn Error>> {
    let mut sized: Vec<(String, f64)> = Vec::new();
    for record in records {
        if let Ok(value) = record.sv_len.parse::<f64>() {
            if value.is_finite() {
                sized.push((gene_label(record).to_string(), value.abs()));
            }
        }
    }
    if sized.len() < 3 {
        println!("  -> Too few variants with a numeric SV length, skipping size plot.");
        return Ok(());
    }

    const BINS: usize = 30;
    let min_len = sized.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
    let max_len = sized.iter().map(|(_, v)| *v).fold(0.0f64, f64::max);
    let width = (max_len - min_len).max(1.0) / BINS as f64;

    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, Vec<u32>> = HashMap::new();
    for (gene, length) in &sized {
        let bin = (((length - min_len) / width) as usize).min(BINS - 1);
        if !counts.contains_key(gene) {
            order.push(gene.clone());
        }
        counts.entry(gene.clone()).or_insert_with(|| vec![0u32; BINS])[bin] += 1;
    }
    let max_count = (0..BINS)
        .map(|b| order.iter().map(|g| counts[g][b]).sum::<u32>())
        .max()
        .unwrap_or(0)
        .max(1);

    let root = BitMapBackend::new(plot_path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            "Distribution of structural variant sizes by gene",
            ("sans-serif", 30),
        )
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(
            min_len..(min_len + width * BINS as f64),
            0u32..(max_count + 1),
        )?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("Absolute SV length (bp)")
        .y_desc("Count")
        .draw()?;

    let mut base = vec![0u32; BINS];
    for (gi, gene) in order.iter().enumerate() {
        let gene_counts = &counts[gene];
        let mut bars = Vec::new();
        for b in 0..BINS {
            let count = gene_counts[b];
            if count == 0 {
                continue;
            }
            let x0 = min_len + b as f64 * width;
            bars.push(Rectangle::new(
                [(x0, base[b]), (x0 + width, base[b] + count)],
                Palette99::pick(gi).filled(),
            ));
        }
        chart.draw_series(bars)?.label(gene.clone()).legend(move |(x, y)| {
            Rectangle::new([(x, y - 5), (x + 10, y + 5)], Palette99::pick(gi).filled())
        });
        for b in 0..BINS {
            base[b] += gene_counts[b];
        }
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;

    println!("  -> SV size distribution plot saved: {}", plot_path.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("svscan.log")?;

    println!("=== 1000 Genomes SV Region Scanner ===");
    writeln!(log_file, "=== 1000 Genomes SV Region Scanner ===")?;

    let now: DateTime<Utc> = Utc::now();
    println!("[LOG] Timestamp: {}", now.to_rfc3339());
    writeln!(log_file, "[LOG] Timestamp: {}", now.to_rfc3339())?;

    let args = Args::parse();
    println!("[LOG] Output Directory: {}", args.output_dir.display());
    writeln!(log_file, "[LOG] Output Directory: {}", args.output_dir.display())?;
    println!("[LOG] SV Types: {}", args.sv_types.join(", "));
    writeln!(log_file, "[LOG] SV Types: {}", args.sv_types.join(", "))?;
    println!("[LOG] Max Records: {:?}", args.max_records);
    writeln!(log_file, "[LOG] Max Records: {:?}", args.max_records)?;
    println!("[LOG] Region Filter: {}", !args.no_region_filter);
    writeln!(log_file, "[LOG] Region Filter: {}", !args.no_region_filter)?;

    println!(
        "[STEP] Ensuring output directory exists: {}",
        args.output_dir.display()
    );
    writeln!(
        log_file,
        "[STEP] Ensuring output directory exists: {}",
        args.output_dir.display()
    )?;
    fs::create_dir_all(&args.output_dir)?;

    let vcf_path = match &args.input {
        Some(path) => {
            if !path.exists() {
                return Err(format!("VCF file not found: {}", path.display()).into());
            }
            println!("[STEP] Using local VCF: {}", path.display());
            writeln!(log_file, "[STEP] Using local VCF: {}", path.display())?;
            path.clone()
        }
        None => {
            println!("[STEP] Ensuring SV genotypes archive exists locally...");
            writeln!(
                log_file,
                "[STEP] Ensuring SV genotypes archive exists locally..."
            )?;
            let gz_path = args.output_dir.join("1000g_sv_genotypes_GRCh38.vcf.gz");
            let decompressed = args.output_dir.join("1000g_sv_genotypes_GRCh38.vcf");
            ensure_sv_vcf(&gz_path, &mut log_file)?;
            decompress_vcf(&gz_path, &decompressed, &mut log_file)?;
            println!("  -> VCF ready at {}", decompressed.display());
            writeln!(log_file, "  -> VCF ready at {}", decompressed.display())?;
            decompressed
        }
    };

    explore_vcf(
        &vcf_path,
        &args.output_dir.join("vcf_summary.txt"),
        &mut log_file,
    )?;

    let options = ScanOptions {
        sv_types: args.sv_types.clone(),
        regions: if args.no_region_filter {
            None
        } else {
            Some(default_gene_regions())
        },
        max_records: args.max_records,
    };
    let scan = collect_sv_records(&vcf_path, &options, &mut log_file)?;

    let summary_path = args.output_dir.join("sv_summary.txt");
    if scan.records.is_empty() {
        println!("No matching structural variants found.");
        writeln!(log_file, "No matching structural variants found.")?;
        write_no_match_summary(&summary_path)?;
        println!("  -> Summary saved to {}", summary_path.display());
        writeln!(log_file, "  -> Summary saved to {}", summary_path.display())?;
        return Ok(());
    }

    println!("Found {} matching variants!", scan.records.len());
    writeln!(log_file, "Found {} matching variants!", scan.records.len())?;
    print!("{}", render_preview_table(&scan.records, 10));

    let csv_path = args.output_dir.join("sv_results.csv");
    println!("[STEP] Writing results CSV to: {}", csv_path.display());
    writeln!(log_file, "[STEP] Writing results CSV to: {}", csv_path.display())?;
    write_results_csv(&scan.records, &csv_path)?;
    println!(
        "Done. Wrote {} variants to {}",
        scan.records.len(),
        csv_path.display()
    );
    writeln!(
        log_file,
        "Done. Wrote {} variants to {}",
        scan.records.len(),
        csv_path.display()
    )?;

    println!("[STEP] Writing scan summary to: {}", summary_path.display());
    writeln!(
        log_file,
        "[STEP] Writing scan summary to: {}",
        summary_path.display()
    )?;
    write_scan_summary(&scan, &options, &vcf_path, &summary_path)?;
    println!("  -> Summary saved to {}", summary_path.display());
    writeln!(log_file, "  -> Summary saved to {}", summary_path.display())?;

    println!("[STEP] Rendering plots...");
    writeln!(log_file, "[STEP] Rendering plots...")?;
    plot_population_frequencies(
        &scan.records,
        &args.output_dir.join("sv_population_frequencies.png"),
    )?;
    plot_sv_size_distribution(
        &scan.records,
        &args.output_dir.join("sv_size_distribution.png"),
    )?;

    println!("Done.");
    writeln!(log_file, "Done.")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_regions() -> Vec<GeneRegion> {
        vec![
            GeneRegion::new("GENEA", "1", 10, 20),
            GeneRegion::new("GENEB", "2", 100, 200),
        ]
    }

    fn scan_options(regions: Option<Vec<GeneRegion>>, max_records: Option<u64>) -> ScanOptions {
        ScanOptions {
            sv_types: vec!["DEL".to_string(), "DUP".to_string()],
            regions,
            max_records,
        }
    }

    fn sv_line(chrom: &str, pos: u64, info: &str) -> String {
        format!("{chrom}\t{pos}\tid1\tA\t<DEL>\t.\tPASS\t{info}\tGT")
    }

    fn write_vcf(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("test.vcf");
        fs::write(&path, body).unwrap();
        path
    }

    fn log_sink(dir: &Path) -> File {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scan.log"))
            .unwrap()
    }

    fn vcf_header() -> String {
        [
            "##fileformat=VCFv4.1",
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT",
        ]
        .join("\n")
    }

    #[test]
    fn info_field_keeps_last_duplicate_and_drops_flags() {
        let map = parse_info_field("SVTYPE=DEL;IMPRECISE;END=500;SVTYPE=DUP");
        assert_eq!(map.get("SVTYPE"), Some(&"DUP".to_string()));
        assert_eq!(map.get("END"), Some(&"500".to_string()));
        assert!(!map.contains_key("IMPRECISE"));
    }

    #[test]
    fn extracts_all_fields_from_a_full_line() {
        let line = sv_line(
            "10",
            112_990_000,
            "SVTYPE=DEL;END=113000000;SVLEN=-10000;SAS_AF=0.25;EUR_AF=0.1;AFR_AF=0.05",
        );
        let record = parse_sv_line(&line).unwrap().unwrap();
        assert_eq!(record.chrom, "10");
        assert_eq!(record.pos, 112_990_000);
        assert_eq!(record.end, 113_000_000);
        assert_eq!(record.sv_type, "DEL");
        assert_eq!(record.sv_len, "-10000");
        assert_eq!(record.af_sas, "0.25");
        assert_eq!(record.af_eur, "0.1");
        assert_eq!(record.af_afr, "0.05");
        assert!(record.gene.is_none());
    }

    #[test]
    fn short_lines_are_skipped_without_error() {
        assert!(parse_sv_line("1\t100\tonly-three-columns")
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_info_keys_fall_back_to_defaults() {
        let line = sv_line("3", 5_000, "IMPRECISE");
        let record = parse_sv_line(&line).unwrap().unwrap();
        assert_eq!(record.sv_type, "UNKNOWN");
        assert_eq!(record.sv_len, "NA");
        assert_eq!(record.end, 5_000);
        assert_eq!(record.af_sas, "NA");
        assert_eq!(record.af_eur, "NA");
        assert_eq!(record.af_afr, "NA");
    }

    #[test]
    fn malformed_position_is_fatal() {
        let line = "1\tnot-a-number\tid\tA\t<DEL>\t.\tPASS\tSVTYPE=DEL\tGT";
        assert!(matches!(parse_sv_line(line), Err(ScanError::Parse(_))));
    }

    #[test]
    fn malformed_end_is_fatal() {
        let line = sv_line("1", 100, "SVTYPE=DEL;END=soon");
        assert!(matches!(parse_sv_line(&line), Err(ScanError::Parse(_))));
    }

    #[test]
    fn long_info_is_truncated_with_marker() {
        let info = format!("SVTYPE=DEL;NOTE={}", "x".repeat(300));
        let line = sv_line("1", 100, &info);
        let record = parse_sv_line(&line).unwrap().unwrap();
        assert_eq!(record.info.chars().count(), 203);
        assert!(record.info.ends_with("..."));
        assert!(record.info.starts_with("SVTYPE=DEL;NOTE="));

        assert_eq!(truncate_info("short"), "short");
    }

    #[test]
    fn overlap_requires_same_chromosome_and_interval_intersection() {
        let regions = test_regions();
        assert_eq!(
            find_overlapping_gene(&regions, "1", 15, 25).map(|r| r.gene.as_str()),
            Some("GENEA")
        );
        assert!(find_overlapping_gene(&regions, "1", 25, 30).is_none());
        assert!(find_overlapping_gene(&regions, "2", 15, 25).is_none());
        // spanning the whole region counts, containment is not required
        assert!(find_overlapping_gene(&regions, "1", 5, 30).is_some());
        assert_eq!(
            find_overlapping_gene(&regions, "2", 150, 160).map(|r| r.gene.as_str()),
            Some("GENEB")
        );
    }

    #[test]
    fn first_defined_region_wins_on_ties() {
        let regions = vec![
            GeneRegion::new("FIRST", "1", 0, 100),
            GeneRegion::new("SECOND", "1", 0, 100),
        ];
        assert_eq!(
            find_overlapping_gene(&regions, "1", 50, 60).map(|r| r.gene.as_str()),
            Some("FIRST")
        );
    }

    #[test]
    fn collects_only_matching_types_inside_regions() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [
            vcf_header(),
            sv_line("1", 15, "SVTYPE=DEL;END=18;SAS_AF=0.2"),
            sv_line("1", 15, "SVTYPE=INV;END=18"),
            sv_line("9", 15, "SVTYPE=DUP;END=18"),
            sv_line("2", 150, "SVTYPE=DUP;END=160;SAS_AF=0.4"),
        ]
        .join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan = collect_sv_records(&path, &scan_options(Some(test_regions()), None), &mut log)
            .unwrap();
        assert_eq!(scan.processed, 4);
        assert_eq!(scan.records.len(), 2);
        let genes: Vec<String> = scan
            .records
            .iter()
            .map(|r| r.gene.clone().unwrap())
            .collect();
        assert!(genes.contains(&"GENEA".to_string()));
        assert!(genes.contains(&"GENEB".to_string()));
    }

    #[test]
    fn short_lines_count_as_processed_but_are_never_kept() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [
            vcf_header(),
            "1\t15\tonly".to_string(),
            sv_line("1", 15, "SVTYPE=DEL;END=18"),
        ]
        .join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan = collect_sv_records(&path, &scan_options(Some(test_regions()), None), &mut log)
            .unwrap();
        assert_eq!(scan.processed, 2);
        assert_eq!(scan.records.len(), 1);
    }

    #[test]
    fn record_cap_stops_the_scan_early() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [
            vcf_header(),
            sv_line("1", 12, "SVTYPE=DEL;END=14"),
            sv_line("1", 13, "SVTYPE=DEL;END=15"),
            sv_line("1", 14, "SVTYPE=DEL;END=16"),
            sv_line("1", 15, "SVTYPE=DEL;END=17"),
        ]
        .join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan =
            collect_sv_records(&path, &scan_options(Some(test_regions()), Some(2)), &mut log)
                .unwrap();
        // the counter moves once past the cap, the line behind it is never parsed
        assert_eq!(scan.processed, 3);
        assert_eq!(scan.records.len(), 2);
    }

    #[test]
    fn records_sort_by_sas_frequency_descending_with_na_as_zero() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [
            vcf_header(),
            sv_line("1", 12, "SVTYPE=DEL;END=14;SAS_AF=0.1"),
            sv_line("1", 13, "SVTYPE=DEL;END=15"),
            sv_line("1", 14, "SVTYPE=DEL;END=16;SAS_AF=0.5"),
        ]
        .join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan = collect_sv_records(&path, &scan_options(Some(test_regions()), None), &mut log)
            .unwrap();
        let freqs: Vec<&str> = scan.records.iter().map(|r| r.af_sas.as_str()).collect();
        assert_eq!(freqs, vec!["0.5", "0.1", "NA"]);
    }

    #[test]
    fn region_filter_disabled_keeps_all_type_matches() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [
            vcf_header(),
            sv_line("9", 15, "SVTYPE=DEL;END=18"),
            sv_line("1", 15, "SVTYPE=INV;END=18"),
        ]
        .join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan = collect_sv_records(&path, &scan_options(None, None), &mut log).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].sv_type, "DEL");
        assert!(scan.records[0].gene.is_none());
    }

    #[test]
    fn missing_file_is_reported_before_scanning() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let err = collect_sv_records(
            &dir.path().join("absent.vcf"),
            &scan_options(None, None),
            &mut log,
        )
        .unwrap_err();
        assert!(err.to_string().contains("VCF file not found"));
    }

    #[test]
    fn empty_scan_yields_absence_and_a_no_match_artifact() {
        let dir = tempdir().unwrap();
        let mut log = log_sink(dir.path());
        let body = [vcf_header(), sv_line("1", 15, "SVTYPE=INV;END=18")].join("\n");
        let path = write_vcf(dir.path(), &body);

        let scan = collect_sv_records(&path, &scan_options(Some(test_regions()), None), &mut log)
            .unwrap();
        assert_eq!(scan.processed, 1);
        assert!(scan.records.is_empty());

        let summary_path = dir.path().join("sv_summary.txt");
        write_no_match_summary(&summary_path).unwrap();
        let content = fs::read_to_string(&summary_path).unwrap();
        assert_eq!(content, "No matching structural variants found.\n");
    }

    #[test]
    fn csv_export_round_trips_every_field_as_text() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("sv_results.csv");

        let mut first = parse_sv_line(&sv_line(
            "1",
            15,
            "SVTYPE=DEL;END=18;SVLEN=-3;SAS_AF=0.2;EUR_AF=0.1;AFR_AF=0.3",
        ))
        .unwrap()
        .unwrap();
        first.gene = Some("GENEA".to_string());
        let second = parse_sv_line(&sv_line("7", 44_150_000, "SVTYPE=DUP"))
            .unwrap()
            .unwrap();
        write_results_csv(&[first, second], &csv_path).unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers, &csv::StringRecord::from(RESULT_COLUMNS.to_vec()));
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][1], "15");
        assert_eq!(&rows[0][2], "18");
        assert_eq!(&rows[0][4], "-3");
        assert_eq!(&rows[0][5], "0.2");
        assert_eq!(&rows[0][8], "GENEA");
        assert_eq!(&rows[1][2], "44150000");
        assert_eq!(&rows[1][4], "NA");
        assert_eq!(&rows[1][5], "NA");
        assert_eq!(&rows[1][8], "None");
        assert_eq!(&rows[1][9], "SVTYPE=DUP");
    }

    #[test]
    fn scan_summary_reports_configuration_and_preview() {
        let dir = tempdir().unwrap();
        let summary_path = dir.path().join("sv_summary.txt");
        let vcf_path = dir.path().join("test.vcf");

        let records = vec![
            parse_sv_line(&sv_line("1", 15, "SVTYPE=DEL;END=18;SAS_AF=0.2"))
                .unwrap()
                .unwrap(),
            parse_sv_line(&sv_line("2", 150, "SVTYPE=DUP;END=160"))
                .unwrap()
                .unwrap(),
        ];
        let scan = SvScan {
            records,
            processed: 3,
        };
        write_scan_summary(
            &scan,
            &scan_options(Some(test_regions()), None),
            &vcf_path,
            &summary_path,
        )
        .unwrap();

        let content = fs::read_to_string(&summary_path).unwrap();
        assert!(content.contains("Total variants processed: 3"));
        assert!(content.contains("Variants kept: 2"));
        assert!(content.contains("SV types filtered: DEL, DUP"));
        assert!(content.contains("Gene regions searched: GENEA, GENEB"));
        assert!(content.contains("First 10 rows:"));
        assert!(content.contains("CHROM"));
    }

    #[test]
    fn preview_table_limits_rows_and_aligns_headers() {
        let records: Vec<SvRecord> = (0..12)
            .map(|i| {
                parse_sv_line(&sv_line("1", 100 + i, "SVTYPE=DEL;END=110"))
                    .unwrap()
                    .unwrap()
            })
            .collect();
        let table = render_preview_table(&records, 10);
        assert_eq!(table.lines().count(), 11);
        let header = table.lines().next().unwrap();
        assert!(header.contains("CHROM"));
        assert!(header.contains("SAS_AF"));
    }

    #[test]
    fn sort_keys_parse_leniently_but_fields_keep_their_text() {
        assert_eq!(numeric_or_zero("0.25"), 0.25);
        assert_eq!(numeric_or_zero("NA"), 0.0);
        assert_eq!(numeric_or_zero(""), 0.0);
    }

    #[test]
    fn default_regions_preserve_definition_order_and_padding() {
        let regions = default_gene_regions();
        assert_eq!(regions.len(), 9);
        assert_eq!(regions[0].gene, "TCF7L2");
        assert_eq!(regions[0].chrom, "10");
        assert_eq!(regions[0].start, 112_850_000);
        assert_eq!(regions[0].end, 113_400_000);
        assert_eq!(regions[8].gene, "LCT");
    }
}
