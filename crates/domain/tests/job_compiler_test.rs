#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use renderfarm_core::{Clock, JobStatus, ManagerError};
    use renderfarm_domain::job_compiler::simple_blender_render::SimpleBlenderRender;
    use renderfarm_domain::{
        AuthoredJob, AuthoredTask, JobCompiler, JobType, JobTypeDescriptor, SettingDescriptor,
        SettingType, SubmittedJob,
    };
    use serde_json::json;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()))
    }

    fn blender_submission() -> SubmittedJob {
        let settings = json!({
            "filepath": "/projects/shot/shot.flamenco.blend",
            "frames": "1-30",
            "chunk_size": 10,
            "render_output_path": "/render/shot/######",
            "format": "PNG",
            "fps": 24.0,
            "output_file_extension": ".png",
        });
        SubmittedJob {
            name: "Shot 010".to_string(),
            job_type: "simple-blender-render".to_string(),
            priority: 50,
            settings: settings.as_object().unwrap().clone(),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_job_produces_video_task_depending_on_all_renders() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let job = compiler.compile(&blender_submission()).unwrap();

        assert_eq!(job.status, JobStatus::UnderConstruction);
        assert_eq!(job.created, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(job.tasks().len(), 4);

        let render_names: Vec<&str> = job
            .tasks()
            .iter()
            .filter(|t| t.task_type == "blender")
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(render_names, vec!["render-1-10", "render-11-20", "render-21-30"]);
        for task in job.tasks().iter().filter(|t| t.task_type == "blender") {
            assert!(task.dependencies().is_empty());
        }

        let (video_idx, video) = job.find_task("create-video").unwrap();
        assert_eq!(video.task_type, "ffmpeg");
        assert_eq!(video.dependencies().len(), 3);
        for dep in video.dependencies() {
            assert_eq!(job.task(*dep).unwrap().task_type, "blender");
            assert!(*dep < video_idx);
        }
    }

    #[test]
    fn test_persisted_records_keep_dependency_structure() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let authored = compiler.compile(&blender_submission()).unwrap();
        let (job, tasks) = authored.to_records(Utc::now());

        let video = tasks.iter().find(|t| t.name == "create-video").unwrap();
        let render_ids: Vec<_> = tasks
            .iter()
            .filter(|t| t.task_type == "blender")
            .map(|t| t.id)
            .collect();
        assert_eq!(video.dependencies, render_ids);
        assert!(tasks.iter().all(|t| t.job_id == job.id));
    }

    #[test]
    fn test_exr_output_has_no_video_task() {
        let mut submission = blender_submission();
        submission.settings.insert("format".into(), json!("OPEN_EXR"));
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let job = compiler.compile(&submission).unwrap();
        assert_eq!(job.tasks().len(), 3);
        assert!(job.find_task("create-video").is_none());
    }

    #[test]
    fn test_unknown_job_type() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let mut submission = blender_submission();
        submission.job_type = "no-such-type".to_string();
        let err = compiler.compile(&submission).unwrap_err();
        assert!(matches!(err, ManagerError::JobTypeUnknown(name) if name == "no-such-type"));
    }

    #[test]
    fn test_missing_required_setting_is_rejected() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let mut submission = blender_submission();
        submission.settings.remove("frames");
        let err = compiler.compile(&submission).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidJobSettings(_)));
    }

    #[test]
    fn test_oversized_frame_range_is_rejected() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let mut submission = blender_submission();
        submission.settings.insert("frames".into(), json!("1-9999999999"));
        let err = compiler.compile(&submission).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidJobSettings(_)));
    }

    #[test]
    fn test_compile_is_deterministic_apart_from_identifiers() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let a = compiler.compile(&blender_submission()).unwrap();
        let b = compiler.compile(&blender_submission()).unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.tasks(), b.tasks());
        assert_eq!(a.settings, b.settings);
    }

    #[test]
    fn test_list_job_types_sorted_by_name() {
        let compiler = JobCompiler::with_builtin_job_types(clock());
        let names: Vec<String> = compiler
            .list_job_types()
            .unwrap()
            .into_iter()
            .map(|info| info.descriptor.name)
            .collect();
        assert_eq!(names, vec!["echo-sleep-test", "simple-blender-render"]);
    }

    /// 一个设置结构可以改变的作业类型，用于验证etag
    struct Adjustable {
        default_message: &'static str,
    }

    impl JobType for Adjustable {
        fn descriptor(&self) -> JobTypeDescriptor {
            JobTypeDescriptor {
                name: "adjustable".to_string(),
                label: "Adjustable".to_string(),
                settings: vec![SettingDescriptor::new("message", SettingType::String)
                    .with_default(json!(self.default_message))],
            }
        }

        fn compile(&self, job: &mut AuthoredJob) -> renderfarm_core::ManagerResult<()> {
            job.add_task(AuthoredTask::new("only", "misc"));
            Ok(())
        }
    }

    fn adjustable_compiler(default_message: &'static str) -> JobCompiler {
        let mut compiler = JobCompiler::new(clock());
        compiler.register(Arc::new(Adjustable { default_message }));
        compiler
    }

    #[test]
    fn test_etag_round_trip() {
        let compiler = adjustable_compiler("hello");
        let etag = compiler.get_job_type("adjustable").unwrap().etag;

        let submission = SubmittedJob {
            name: "etag".to_string(),
            job_type: "adjustable".to_string(),
            type_etag: Some(etag.clone()),
            ..Default::default()
        };
        assert!(compiler.compile(&submission).is_ok());

        // 描述变化后，旧etag被拒绝
        let changed = adjustable_compiler("goodbye");
        let err = changed.compile(&submission).unwrap_err();
        assert!(matches!(err, ManagerError::JobTypeBadEtag { .. }));

        // 不带etag总是可以编译
        let without_etag = SubmittedJob {
            type_etag: None,
            ..submission.clone()
        };
        assert!(changed.compile(&without_etag).is_ok());
        let empty_etag = SubmittedJob {
            type_etag: Some(String::new()),
            ..submission
        };
        assert!(changed.compile(&empty_etag).is_ok());
    }

    #[test]
    fn test_builtin_registration_is_replaceable() {
        let mut compiler = JobCompiler::new(clock());
        compiler.register(Arc::new(SimpleBlenderRender));
        compiler.register(Arc::new(SimpleBlenderRender));
        assert_eq!(compiler.list_job_types().unwrap().len(), 1);
    }
}
