//! Getting tables to the server: inline form fields, CSV file parts, or
//! files uploaded ahead of the job.

use sasjs_config::ServerType;
use sasjs_tables::{
    build_request_fields, csv_files, CsvFile, RequestFields, TableSet, CSV_CONTENT_TYPE,
};

use crate::error::Error;
use crate::request::RequestClient;
use crate::transport::MultipartPart;

/// Serialized payloads longer than this go as files.
pub(crate) const MAX_INLINE_PAYLOAD_CHARS: usize = 500_000;

const RAW_UPLOAD_PATH: &str = "/files/files#rawUpload";

/// Whether tables must travel as files rather than inline fields.
/// SAS 9 always takes files. A `;` anywhere in the payload would break the
/// inline macro-variable route.
pub(crate) fn needs_file_upload(server_type: ServerType, data: &TableSet) -> bool {
    if server_type == ServerType::Sas9 {
        return true;
    }
    let payload = data.to_json_string();
    payload.chars().count() > MAX_INLINE_PAYLOAD_CHARS || payload.contains(';')
}

/// Form parts for a web submission: one CSV file per table, or the encoded
/// `sasjs<n>data` fields.
pub(crate) fn table_parts(data: &TableSet, as_files: bool) -> Result<Vec<MultipartPart>, Error> {
    if as_files {
        return Ok(csv_files(data)?
            .into_iter()
            .map(|file| MultipartPart::file(file.table, file.file_name, CSV_CONTENT_TYPE, file.content))
            .collect());
    }

    Ok(build_request_fields(data)?
        .into_iter()
        .map(|(name, value)| MultipartPart::text(name, value))
        .collect())
}

/// Tables encoded ahead of the first request, so an oversized value fails
/// the call before anything reaches the server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EncodedTables {
    Fields(RequestFields),
    Files(Vec<CsvFile>),
}

impl EncodedTables {
    pub(crate) fn none() -> Self {
        EncodedTables::Fields(Vec::new())
    }

    pub(crate) fn inline(data: &TableSet) -> Result<Self, Error> {
        Ok(EncodedTables::Fields(build_request_fields(data)?))
    }

    pub(crate) fn files(data: &TableSet) -> Result<Self, Error> {
        Ok(EncodedTables::Files(csv_files(data)?))
    }

    /// Fields for the job: inline fields as they are, files uploaded first.
    pub(crate) fn into_fields(
        self,
        client: &RequestClient,
        token: Option<&str>,
    ) -> Result<RequestFields, Error> {
        match self {
            EncodedTables::Fields(fields) => Ok(fields),
            EncodedTables::Files(files) => upload_files(client, &files, token),
        }
    }
}

/// Upload every file to the files service and describe the uploads with
/// `_webin_*` fields.
pub(crate) fn upload_files(
    client: &RequestClient,
    files: &[CsvFile],
    token: Option<&str>,
) -> Result<RequestFields, Error> {
    let mut fields = vec![("_webin_file_count".to_string(), files.len().to_string())];

    for (i, file) in files.iter().enumerate() {
        let index = i + 1;
        let response = client.upload_file(RAW_UPLOAD_PATH, &file.content, CSV_CONTENT_TYPE, token)?;
        let id = response.result["id"]
            .as_str()
            .ok_or_else(|| Error::Webout(format!("upload of {} returned no file id", file.file_name)))?;
        log::debug!("uploaded {} as file {}", file.file_name, id);

        fields.push((format!("_webin_fileuri{index}"), format!("/files/files/{id}")));
        fields.push((format!("_webin_name{index}"), file.table.clone()));
    }
    Ok(fields)
}
