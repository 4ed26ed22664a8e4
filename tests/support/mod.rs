//! Shared helpers for integration tests: an in-process container engine with
//! per-step fault injection, and package builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use zip::write::FileOptions;
use zip::ZipWriter;

use package_evaluator::archive::TranscodedArchive;
use package_evaluator::logs::{encode_frame, Channel};
use package_evaluator::{ContainerEngine, EngineError, Package};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Pull,
    Create,
    Upload,
    Start,
    Wait,
    Logs,
    Download,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    pub image: String,
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub id: String,
    pub path: String,
    pub tar: Vec<u8>,
}

/// Scriptable [`ContainerEngine`] that records every call.
#[derive(Default)]
pub struct FakeEngine {
    failing: HashSet<Step>,
    exit_code: i64,
    logs: Vec<u8>,
    report: Option<Vec<u8>>,
    hang_on_wait: bool,
    next_id: AtomicUsize,
    calls: Mutex<Vec<(Step, String)>>,
    created: Mutex<Vec<Created>>,
    uploads: Mutex<Vec<Upload>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, step: Step) -> Self {
        self.failing.insert(step);
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_logs(mut self, frames: &[(Channel, &[u8])]) -> Self {
        self.logs = frames
            .iter()
            .flat_map(|(channel, payload)| encode_frame(*channel, payload))
            .collect();
        self
    }

    pub fn with_raw_logs(mut self, raw: Vec<u8>) -> Self {
        self.logs = raw;
        self
    }

    pub fn with_report(mut self, report: &[u8]) -> Self {
        self.report = Some(report.to_vec());
        self
    }

    pub fn hanging_on_wait(mut self) -> Self {
        self.hang_on_wait = true;
        self
    }

    pub fn calls(&self) -> Vec<Step> {
        self.calls.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn count(&self, step: Step) -> usize {
        self.calls().into_iter().filter(|s| *s == step).count()
    }

    /// Ids passed to `remove_container`, in call order.
    pub fn removed_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == Step::Remove)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn created(&self) -> Vec<Created> {
        self.created.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    fn record(&self, step: Step, subject: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push((step, subject.to_string()));
        if self.failing.contains(&step) {
            return Err(match step {
                Step::Create => EngineError::NotFound("no such image".to_string()),
                _ => EngineError::Api {
                    status: 500,
                    message: format!("injected {step:?} fault"),
                },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(Step::Pull, image)
    }

    async fn create_container(&self, image: &str, cmd: &[String]) -> Result<String, EngineError> {
        self.record(Step::Create, image)?;
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(Created {
            id: id.clone(),
            image: image.to_string(),
            cmd: cmd.to_vec(),
        });
        Ok(id)
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: TranscodedArchive,
    ) -> Result<(), EngineError> {
        self.record(Step::Upload, id)?;
        let (chunks, reader) = archive.into_stream(4096);
        let tar = chunks
            .fold(Vec::new(), |mut tar, chunk| async move {
                tar.extend_from_slice(&chunk);
                tar
            })
            .await;
        reader
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))??;
        self.uploads.lock().unwrap().push(Upload {
            id: id.to_string(),
            path: path.to_string(),
            tar,
        });
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(Step::Start, id)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        self.record(Step::Wait, id)?;
        if self.hang_on_wait {
            futures::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn container_logs(&self, id: &str) -> Result<Bytes, EngineError> {
        self.record(Step::Logs, id)?;
        Ok(Bytes::from(self.logs.clone()))
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Bytes>, EngineError> {
        self.record(Step::Download, id)?;
        Ok(self
            .report
            .as_ref()
            .map(|report| Bytes::from(single_file_tar(file_name(path), report))))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(Step::Remove, id)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A tar archive holding one regular file, the way the engine answers a
/// single-path download.
pub fn single_file_tar(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn package(files: &[(&str, &[u8])]) -> Package {
    Package::from_bytes(zip_bytes(files))
}

pub fn hello_package() -> Package {
    package(&[
        ("Makefile", b"test:\n\tpython main.py\n"),
        ("main.py", b"print('hello')\n"),
    ])
}

/// Names of all entries in a tar archive.
pub fn tar_names(tar: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(tar);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}
