//! Lab metadata spreadsheets: header discovery by flag cell, sample to file
//! declarations, and merging several sub-submission sheets into one.

use std::collections::HashSet;
use std::path::Path;

use calamine::{Reader, open_workbook_auto};
use rust_xlsxwriter::Workbook;

use crate::config::MetadataLayout;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRow {
    pub index: usize,
    /// Column names paired with their cell position in the row.
    pub columns: Vec<(usize, String)>,
}

impl HeaderRow {
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|(_, name)| name.as_str()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .find(|(_, column)| column == name)
            .map(|(pos, _)| *pos)
    }
}

/// What a metadata row says about one sample's read files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDeclaration {
    pub sample_id: String,
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub paired: bool,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub samples: Vec<SampleDeclaration>,
    pub warnings: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MetadataWorkbook {
    pub source: String,
    pub sheet: String,
    rows: Vec<Vec<String>>,
    header: HeaderRow,
}

impl MetadataWorkbook {
    /// Reads the configured sheet (ignored for CSV) and locates its header.
    pub fn load(path: &Path, layout: &MetadataLayout) -> Result<Self, SyncError> {
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let rows = if is_csv(path) {
            read_csv_rows(path, &source)?
        } else {
            read_sheet_rows(path, &source, &layout.sheet_name)?
        };
        let header = locate_header(&rows, &source, layout)?;
        Ok(Self {
            source,
            sheet: layout.sheet_name.clone(),
            rows,
            header,
        })
    }

    pub fn from_rows(
        source: &str,
        rows: Vec<Vec<String>>,
        layout: &MetadataLayout,
    ) -> Result<Self, SyncError> {
        let header = locate_header(&rows, source, layout)?;
        Ok(Self {
            source: source.to_string(),
            sheet: layout.sheet_name.clone(),
            rows,
            header,
        })
    }

    pub fn header(&self) -> &HeaderRow {
        &self.header
    }

    pub fn data_rows(&self) -> impl Iterator<Item = &Vec<String>> {
        let positions: Vec<usize> = self.header.columns.iter().map(|(pos, _)| *pos).collect();
        self.rows[self.header.index + 1..].iter().filter(move |row| {
            positions
                .iter()
                .any(|pos| row.get(*pos).is_some_and(|cell| !cell.is_empty()))
        })
    }

    pub fn row_count(&self) -> usize {
        self.data_rows().count()
    }

    fn cell<'r>(&self, row: &'r [String], column: &str) -> Option<&'r str> {
        self.header
            .position(column)
            .and_then(|pos| row.get(pos))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Per sample, the declared primary and optional secondary file. Identical
    /// duplicates coalesce; a duplicate sample id with different files is
    /// skipped (first occurrence kept) and reported in `warnings`.
    pub fn extract_sample_files(&self, layout: &MetadataLayout) -> Result<Extraction, SyncError> {
        for column in [&layout.sample_id_column, &layout.primary_file_column] {
            if self.header.position(column).is_none() {
                return Err(SyncError::metadata(
                    &self.source,
                    format!("column {column:?} not found in header"),
                ));
            }
        }

        let mut samples: Vec<SampleDeclaration> = Vec::new();
        let mut warnings = Vec::new();
        for row in self.data_rows() {
            let Some(sample_id) = self.cell(row, &layout.sample_id_column) else {
                continue;
            };
            let primary = self
                .cell(row, &layout.primary_file_column)
                .map(str::to_string);
            let secondary = self
                .cell(row, &layout.secondary_file_column)
                .map(str::to_string);
            let paired = match self.cell(row, &layout.layout_column) {
                Some(value) => value.eq_ignore_ascii_case(&layout.paired_layout_value),
                None => secondary.is_some(),
            };
            let declaration = SampleDeclaration {
                sample_id: sample_id.to_string(),
                primary,
                secondary,
                paired,
            };

            match samples.iter().find(|known| known.sample_id == declaration.sample_id) {
                Some(known) if *known == declaration => {}
                Some(known) => warnings.push((
                    declaration.sample_id.clone(),
                    format!(
                        "duplicate sample id with different files ({:?} vs {:?}); later row skipped",
                        known.primary, declaration.primary
                    ),
                )),
                None => samples.push(declaration),
            }
        }
        Ok(Extraction { samples, warnings })
    }

    /// Unions data rows of same-shape workbooks onto the first one, dropping
    /// rows identical to one already present.
    pub fn merge(workbooks: Vec<MetadataWorkbook>) -> Result<MetadataWorkbook, SyncError> {
        let mut iter = workbooks.into_iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| SyncError::metadata("<merge>", "no workbooks to merge"))?;
        let names: Vec<String> = merged.header.names().iter().map(|s| s.to_string()).collect();
        let mut seen: HashSet<Vec<String>> = merged
            .data_rows()
            .map(|row| merged.project(row))
            .collect();
        let width = merged
            .header
            .columns
            .iter()
            .map(|(pos, _)| pos + 1)
            .max()
            .unwrap_or(0);

        for other in iter {
            if other.header.names() != names {
                return Err(SyncError::metadata(
                    &other.source,
                    format!("header does not match {}", merged.source),
                ));
            }
            let projected: Vec<Vec<String>> =
                other.data_rows().map(|row| other.project(row)).collect();
            for values in projected {
                if !seen.insert(values.clone()) {
                    continue;
                }
                let mut row = vec![String::new(); width];
                for ((pos, _), value) in merged.header.columns.iter().zip(values) {
                    row[*pos] = value;
                }
                merged.rows.push(row);
            }
        }
        Ok(merged)
    }

    fn project(&self, row: &[String]) -> Vec<String> {
        self.header
            .columns
            .iter()
            .map(|(pos, _)| row.get(*pos).map(|v| v.trim().to_string()).unwrap_or_default())
            .collect()
    }

    /// Writes every row (preamble, header and data) to `path`; `.csv` targets
    /// are written as CSV, anything else as a single-sheet `.xlsx`.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if is_csv(path) {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_path(path)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            for row in &self.rows {
                writer
                    .write_record(row)
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            }
            return writer
                .flush()
                .map_err(|err| SyncError::Filesystem(err.to_string()));
        }

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet
            .set_name(&self.sheet)
            .map_err(|err| SyncError::metadata(&self.source, err.to_string()))?;
        for (r, row) in self.rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                sheet
                    .write_string(r as u32, c as u16, value)
                    .map_err(|err| SyncError::metadata(&self.source, err.to_string()))?;
            }
        }
        workbook
            .save(path)
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }
}

/// Finds the first row holding `header_flag` and checks its columns against
/// the configured list, exactly and in order.
pub fn locate_header(
    rows: &[Vec<String>],
    source: &str,
    layout: &MetadataLayout,
) -> Result<HeaderRow, SyncError> {
    let flag = layout.header_flag.trim();
    let flag_is_column = layout.expected_columns.iter().any(|c| c == flag);
    let index = rows
        .iter()
        .position(|row| row.iter().any(|cell| cell.trim() == flag))
        .ok_or_else(|| {
            SyncError::metadata(source, format!("no header row flagged with {flag:?}"))
        })?;

    let columns: Vec<(usize, String)> = rows[index]
        .iter()
        .enumerate()
        .map(|(pos, cell)| (pos, cell.trim().to_string()))
        .filter(|(_, cell)| !cell.is_empty() && (flag_is_column || cell != flag))
        .collect();

    if !layout.expected_columns.is_empty() {
        let found: Vec<&str> = columns.iter().map(|(_, name)| name.as_str()).collect();
        if found != layout.expected_columns {
            let missing: Vec<String> = layout
                .expected_columns
                .iter()
                .filter(|name| !found.contains(&name.as_str()))
                .cloned()
                .collect();
            let extra: Vec<String> = found
                .iter()
                .filter(|name| !layout.expected_columns.iter().any(|e| e == *name))
                .map(|name| name.to_string())
                .collect();
            return Err(SyncError::MetadataColumns {
                path: source.to_string(),
                missing,
                extra,
            });
        }
    }

    Ok(HeaderRow { index, columns })
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn read_sheet_rows(path: &Path, source: &str, sheet: &str) -> Result<Vec<Vec<String>>, SyncError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|err| SyncError::metadata(source, err.to_string()))?;
    if !workbook.sheet_names().iter().any(|name| name == sheet) {
        return Err(SyncError::metadata(source, format!("sheet {sheet:?} not found")));
    }
    let range = workbook
        .worksheet_range(sheet)
        .map_err(|err| SyncError::metadata(source, err.to_string()))?;

    // calamine ranges start at the first used cell, so pad back to absolute
    // positions to keep column offsets stable across merged workbooks.
    let (row_offset, col_offset) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut rows = vec![Vec::new(); row_offset];
    for row in range.rows() {
        let mut values = vec![String::new(); col_offset];
        values.extend(row.iter().map(|cell| cell.to_string().trim().to_string()));
        rows.push(values);
    }
    Ok(rows)
}

fn read_csv_rows(path: &Path, source: &str) -> Result<Vec<Vec<String>>, SyncError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| SyncError::metadata(source, err.to_string()))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SyncError::metadata(source, err.to_string()))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
