use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use serde::Serialize;

use crate::engine::EngineError;
use crate::limits::{MAX_UPLOAD_BYTES, MAX_IMPORT_ROWS};

use super::normalize::is_blank;
use super::{Cell, RowInput};

const SNIFF_BYTES: usize = 1024;
const DELIMITERS: [u8; 3] = [b',', b';', b'\t'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    LastName,
    FirstName,
    Email,
    Phone,
    Team,
    StartYear,
    Section,
    RadioCode,
    ProductionLeader,
    MediaTeacher,
    ClassTeacher,
    ManagedClasses,
}

impl Column {
    /// Header lookup: lower-cased, with spaces, `_` and `-` removed.
    fn from_header(header: &str) -> Option<Column> {
        let key: String = header
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        let column = match key.as_str() {
            "lastname" | "vezeteknev" | "vezetéknév" => Column::LastName,
            "firstname" | "keresztnev" | "keresztnév" => Column::FirstName,
            "email" | "emailcím" | "emailcim" => Column::Email,
            "phone" | "telefon" | "telefonszam" | "telefonszám" => Column::Phone,
            "team" | "stab" | "stáb" => Column::Team,
            "startyear" | "startingyear" | "kezdeseve" | "kezdéséve" | "évfolyam" => {
                Column::StartYear
            }
            "section" | "department" | "tagozat" => Column::Section,
            "radiocode" | "radio" | "rádió" | "radiostab" | "rádióstáb" => Column::RadioCode,
            "productionleader" | "gyartasvezeto" | "gyártásvezető" => Column::ProductionLeader,
            "mediateacher" | "mediatana" | "médiatanár" | "mediatanar" => Column::MediaTeacher,
            "classteacher" | "osztalyfonok" | "osztályfőnök" => Column::ClassTeacher,
            "managedclasses" | "classes" | "osztalyai" | "osztályai" => Column::ManagedClasses,
            _ => return None,
        };
        Some(column)
    }

    fn set(self, row: &mut RowInput, value: &str) {
        if !value.is_empty() {
            self.set_cell(row, Cell::Text(value.to_string()));
        }
    }

    /// Text columns take the cell's text; year, flag and class-list columns
    /// keep the typed cell.
    fn set_cell(self, row: &mut RowInput, cell: Cell) {
        let text = cell.text();
        if text.is_empty() {
            return;
        }
        match self {
            Column::LastName => row.last_name = Some(text),
            Column::FirstName => row.first_name = Some(text),
            Column::Email => row.email = Some(text),
            Column::Phone => row.phone = Some(text),
            Column::Team => row.team = Some(text),
            Column::StartYear => row.start_year = Some(cell),
            Column::Section => row.section = Some(text),
            Column::RadioCode => row.radio_code = Some(text),
            Column::ProductionLeader => row.production_leader = Some(cell),
            Column::MediaTeacher => row.media_teacher = Some(cell),
            Column::ClassTeacher => row.class_teacher = Some(cell),
            Column::ManagedClasses => row.managed_classes = Some(cell),
        }
    }
}

const REQUIRED: [(Column, &str); 3] = [
    (Column::LastName, "last_name"),
    (Column::FirstName, "first_name"),
    (Column::Email, "email"),
];

/// Rows read from an uploaded file, plus file-level remarks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedSheet {
    pub rows: Vec<RowInput>,
    pub warnings: Vec<String>,
}

impl ParsedSheet {
    /// Maps the header row onto columns. Unknown headers are warned about,
    /// a missing required column fails the whole file.
    fn columns<I>(&mut self, headers: I) -> Result<Vec<Option<Column>>, EngineError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut columns = Vec::new();
        for header in headers {
            let column = Column::from_header(&header);
            if column.is_none() && !header.is_empty() {
                self.warnings.push(format!("unknown column ignored: {header}"));
            }
            columns.push(column);
        }
        let missing: Vec<&str> = REQUIRED
            .iter()
            .filter(|(c, _)| !columns.contains(&Some(*c)))
            .map(|(_, name)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::validation(
                "content",
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }
        Ok(columns)
    }

    /// `position` names the row in warnings, e.g. `line 3` or `row 3`.
    fn push(&mut self, row: RowInput, position: String) -> Result<(), EngineError> {
        if is_blank(&row) {
            self.warnings.push(format!("{position}: blank row skipped"));
            return Ok(());
        }
        if self.rows.len() == MAX_IMPORT_ROWS {
            return Err(EngineError::LimitExceeded("too many import rows"));
        }
        self.rows.push(row);
        Ok(())
    }
}

/// Most frequent of `,` `;` tab in the head of the file; `,` when none appear.
fn sniff_delimiter(content: &str) -> u8 {
    let head = &content.as_bytes()[..content.len().min(SNIFF_BYTES)];
    let mut best = (b',', 0usize);
    for d in DELIMITERS {
        let n = head.iter().filter(|b| **b == d).count();
        if n > best.1 {
            best = (d, n);
        }
    }
    best.0
}

fn csv_error(e: ::csv::Error) -> EngineError {
    EngineError::validation("content", e.to_string())
}

pub fn parse_import_csv(content: &str) -> Result<ParsedSheet, EngineError> {
    if content.len() > MAX_UPLOAD_BYTES {
        return Err(EngineError::LimitExceeded("csv file too large"));
    }
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    if content.trim().is_empty() {
        return Err(EngineError::validation("content", "file is empty"));
    }

    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(content))
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut parsed = ParsedSheet::default();
    let headers = reader.headers().map_err(csv_error)?.clone();
    let columns = parsed.columns(headers.iter().map(str::to_string))?;

    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let mut row = RowInput::default();
        for (column, value) in columns.iter().zip(record.iter()) {
            if let Some(column) = column {
                column.set(&mut row, value);
            }
        }
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        parsed.push(row, format!("line {line}"))?;
    }
    Ok(parsed)
}

fn xlsx_error(e: calamine::XlsxError) -> EngineError {
    EngineError::validation("content", format!("unreadable xlsx file: {e}"))
}

fn header_text(data: &Data) -> String {
    match data {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_of(data: &Data) -> Option<Cell> {
    match data {
        Data::Int(n) => Some(Cell::Number(*n)),
        Data::Float(x) => Some(Cell::Float(*x)),
        Data::Bool(b) => Some(Cell::Flag(*b)),
        Data::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| Cell::Text(s.to_string()))
        }
        Data::Empty | Data::Error(_) => None,
        other => Some(Cell::Text(other.to_string())),
    }
}

/// First worksheet of an XLSX workbook. The first non-empty row is the
/// header; warnings use 1-based sheet row numbers.
pub fn parse_import_xlsx(bytes: &[u8]) -> Result<ParsedSheet, EngineError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(EngineError::LimitExceeded("xlsx file too large"));
    }
    if bytes.is_empty() {
        return Err(EngineError::validation("content", "file is empty"));
    }

    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).map_err(xlsx_error)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| EngineError::validation("content", "workbook has no sheets"))?
        .map_err(xlsx_error)?;
    let header_row = range.start().map(|(row, _)| row as usize + 1).unwrap_or(1);

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| EngineError::validation("content", "file is empty"))?;
    let mut parsed = ParsedSheet::default();
    let columns = parsed.columns(header.iter().map(header_text))?;

    for (i, cells) in rows.enumerate() {
        let mut row = RowInput::default();
        for (column, data) in columns.iter().zip(cells) {
            if let (Some(column), Some(cell)) = (column, cell_of(data)) {
                column.set_cell(&mut row, cell);
            }
        }
        parsed.push(row, format!("row {}", header_row + i + 1))?;
    }
    Ok(parsed)
}
