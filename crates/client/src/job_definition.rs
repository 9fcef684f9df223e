//! Job definition lookup through the folders service.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::models::{Folder, FolderMember, HasLinks, Items, JobDefinition};
use crate::request::RequestClient;

const MEMBERS_PAGE_LIMIT: u32 = 1000;

/// Finds deployed jobs by path. Folder listings are cached per folder.
pub struct JobDefinitionStore {
    client: Arc<RequestClient>,
    folders: Mutex<HashMap<String, Vec<FolderMember>>>,
}

impl JobDefinitionStore {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self {
            client,
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// Definition of the job at `job_path` (`/folder/path/jobName`).
    pub fn find(&self, job_path: &str, token: Option<&str>) -> Result<JobDefinition, Error> {
        let (folder, name) = job_path
            .rsplit_once('/')
            .ok_or_else(|| Error::JobNotFound(job_path.to_string()))?;
        let folder = if folder.is_empty() { "/" } else { folder };

        let member = self
            .members(folder, token)?
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::JobNotFound(job_path.to_string()))?;

        let link = member
            .link("getResource")
            .ok_or_else(|| Error::missing_link("getResource", format!("folder member {}", member.name)))?;
        let response = self.client.get(&link.href, token)?;

        let mut definition: JobDefinition = serde_json::from_value(response.result)?;
        definition.uri = if member.uri.is_empty() {
            link.href.clone()
        } else {
            member.uri.clone()
        };
        Ok(definition)
    }

    fn members(&self, folder: &str, token: Option<&str>) -> Result<Vec<FolderMember>, Error> {
        if let Some(members) = self.folders.lock().get(folder) {
            return Ok(members.clone());
        }

        let path: String = url::form_urlencoded::byte_serialize(folder.as_bytes()).collect();
        let response = self
            .client
            .get(&format!("/folders/folders/@item?path={path}"), token)?;
        let folder_item: Folder = serde_json::from_value(response.result)?;

        let response = self.client.get(
            &format!(
                "/folders/folders/{}/members?limit={}",
                folder_item.id, MEMBERS_PAGE_LIMIT
            ),
            token,
        )?;
        let members: Items<FolderMember> = serde_json::from_value(response.result)?;

        log::debug!("folder {} has {} members", folder, members.items.len());
        self.folders
            .lock()
            .insert(folder.to_string(), members.items.clone());
        Ok(members.items)
    }
}

#[cfg(test)]
pub(crate) fn script_job_definition(
    transport: &crate::testing::ScriptedTransport,
    folder_id: &str,
    job_name: &str,
    code: &str,
) {
    use crate::testing::reply;
    use crate::transport::Method;
    use serde_json::json;

    transport.always(
        Method::Get,
        "/folders/folders/@item",
        reply::json(200, json!({ "id": folder_id })),
    );
    transport.always(
        Method::Get,
        &format!("/folders/folders/{folder_id}/members"),
        reply::json(
            200,
            json!({ "items": [{
                "name": job_name,
                "uri": format!("/jobDefinitions/definitions/{job_name}"),
                "contentType": "jobDefinition",
                "links": [{ "rel": "getResource", "href": format!("/jobDefinitions/definitions/{job_name}") }]
            }]}),
        ),
    );
    transport.always(
        Method::Get,
        &format!("/jobDefinitions/definitions/{job_name}"),
        reply::json(200, json!({ "id": job_name, "name": job_name, "code": code })),
    );
}
