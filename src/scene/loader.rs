//! Background scene loading
//!
//! [`SceneLoadTask`] owns the worker thread. The worker publishes progress
//! through a shared [`LoadStatus`] and hands the assembled [`Scene`] back over a
//! channel; the render loop polls without blocking. A finished worker stops at
//! [`LoadStatus::Uploading`]; the scene is ready once the device has it.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::RwLock;

use super::{Scene, SceneDescription};
use crate::error::{PipelineError, PipelineResult};

/// Produces scene content; runs on the loader thread
pub trait SceneSource: Send + 'static {
    fn name(&self) -> String;

    fn load(&self, progress: &LoadProgress) -> PipelineResult<SceneDescription>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Pending,
    Loading {
        stage: String,
        done: usize,
        total: usize,
    },
    Assembling,
    /// Assembled on the loader thread, waiting for the render loop to upload it
    Uploading {
        objects: usize,
    },
    Ready {
        objects: usize,
    },
    Failed(String),
}

impl LoadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed(_))
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Waiting to load scene"),
            Self::Loading { stage, done, total } => {
                write!(f, "Loading scene: {} ({}/{})", stage, done, total)
            }
            Self::Assembling => write!(f, "Assembling scene buffers"),
            Self::Uploading { objects } => write!(f, "Uploading scene: {} objects", objects),
            Self::Ready { objects } => write!(f, "Scene ready: {} objects", objects),
            Self::Failed(message) => write!(f, "Scene load failed: {}", message),
        }
    }
}

/// Progress sink handed to a [`SceneSource`]
#[derive(Debug, Clone)]
pub struct LoadProgress {
    status: Arc<RwLock<LoadStatus>>,
}

impl LoadProgress {
    pub fn report(&self, stage: &str, done: usize, total: usize) {
        *self.status.write() = LoadStatus::Loading {
            stage: stage.to_string(),
            done,
            total,
        };
    }

    fn set(&self, status: LoadStatus) {
        *self.status.write() = status;
    }
}

/// Handle to a scene load running on its own thread
pub struct SceneLoadTask {
    name: String,
    status: Arc<RwLock<LoadStatus>>,
    result: Receiver<PipelineResult<Scene>>,
    worker: Option<JoinHandle<()>>,
}

impl SceneLoadTask {
    pub fn spawn<S: SceneSource>(source: S) -> PipelineResult<Self> {
        let name = source.name();
        let status = Arc::new(RwLock::new(LoadStatus::Pending));
        let progress = LoadProgress {
            status: Arc::clone(&status),
        };
        let (sender, result) = bounded(1);

        let worker = std::thread::Builder::new()
            .name("scene-loader".to_string())
            .spawn(move || {
                let outcome = source.load(&progress).and_then(|description| {
                    progress.set(LoadStatus::Assembling);
                    Scene::assemble(description)
                });
                match &outcome {
                    Ok(scene) => progress.set(LoadStatus::Uploading {
                        objects: scene.objects.len(),
                    }),
                    Err(e) => progress.set(LoadStatus::Failed(e.to_string())),
                }
                // Receiver gone means the task was dropped; nothing to report to
                let _ = sender.send(outcome);
            })?;

        log::info!("[SceneLoadTask::spawn] Loading '{}' in the background", name);
        Ok(Self {
            name,
            status,
            result,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> LoadStatus {
        self.status.read().clone()
    }

    /// Non-blocking; yields the scene exactly once
    pub fn poll(&mut self) -> Option<PipelineResult<Scene>> {
        match self.result.try_recv() {
            Ok(outcome) => {
                self.join();
                Some(outcome)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if self.worker.is_none() {
                    return None;
                }
                self.join();
                Some(Err(PipelineError::SceneLoad {
                    message: format!("loader thread for '{}' exited without a result", self.name),
                }))
            }
        }
    }

    /// Block until the load finishes
    pub fn wait(mut self) -> PipelineResult<Scene> {
        let outcome = self.result.recv().map_err(|_| PipelineError::SceneLoad {
            message: format!("loader thread for '{}' exited without a result", self.name),
        });
        self.join();
        outcome?
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[SceneLoadTask::join] Loader thread for '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for SceneLoadTask {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshData, ObjectDesc};
    use glam::Mat4;

    struct OneCube;

    impl SceneSource for OneCube {
        fn name(&self) -> String {
            "one cube".into()
        }

        fn load(&self, progress: &LoadProgress) -> PipelineResult<SceneDescription> {
            progress.report("cube", 1, 1);
            Ok(SceneDescription {
                meshes: vec![MeshData::cube()],
                objects: vec![ObjectDesc {
                    mesh: 0,
                    transform: Mat4::IDENTITY,
                    material: 0,
                }],
                materials: vec![],
            })
        }
    }

    struct Broken;

    impl SceneSource for Broken {
        fn name(&self) -> String {
            "broken".into()
        }

        fn load(&self, _progress: &LoadProgress) -> PipelineResult<SceneDescription> {
            Err(PipelineError::SceneLoad {
                message: "missing file".into(),
            })
        }
    }

    #[test]
    fn test_load_completes_and_waits_for_upload() {
        let task = SceneLoadTask::spawn(OneCube).unwrap();
        let status = task.status.clone();
        let scene = task.wait().unwrap();
        assert_eq!(scene.objects.len(), 1);
        assert_eq!(*status.read(), LoadStatus::Uploading { objects: 1 });
    }

    #[test]
    fn test_poll_yields_once() {
        let mut task = SceneLoadTask::spawn(OneCube).unwrap();
        let mut result = None;
        while result.is_none() {
            result = task.poll();
            std::thread::yield_now();
        }
        assert!(result.unwrap().is_ok());
        assert!(task.poll().is_none());
        // Only the renderer marks a scene ready, once it is on the device
        assert_eq!(task.status(), LoadStatus::Uploading { objects: 1 });
        assert!(!task.status().is_finished());
    }

    #[test]
    fn test_failure_is_reported() {
        let task = SceneLoadTask::spawn(Broken).unwrap();
        let status = task.status.clone();
        assert!(task.wait().is_err());
        assert!(status.read().to_string().contains("missing file"));
    }
}
