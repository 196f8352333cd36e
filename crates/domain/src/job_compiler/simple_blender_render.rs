use serde_json::json;

use renderfarm_core::{Command, ManagerError, ManagerResult};

use super::descriptor::{JobTypeDescriptor, SettingDescriptor, SettingType};
use super::frames::chunk_frames;
use super::{AuthoredJob, AuthoredTask, JobType};

pub const JOB_TYPE_NAME: &str = "simple-blender-render";

/// FFmpeg无法作为输入处理的图像格式
const FFMPEG_INCOMPATIBLE_IMAGE_FORMATS: [&str; 4] =
    ["EXR", "MULTILAYER", "OPEN_EXR", "OPEN_EXR_MULTILAYER"];

/// Blender渲染作业：按帧块生成渲染任务，必要时追加一个依赖全部渲染任务的视频合成任务
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleBlenderRender;

impl JobType for SimpleBlenderRender {
    fn descriptor(&self) -> JobTypeDescriptor {
        JobTypeDescriptor {
            name: JOB_TYPE_NAME.to_string(),
            label: "Simple Blender Render".to_string(),
            settings: vec![
                SettingDescriptor::new("blender_cmd", SettingType::String)
                    .with_default(json!("{blender}"))
                    .with_description("Blender可执行文件"),
                SettingDescriptor::new("filepath", SettingType::String)
                    .required()
                    .with_description("要渲染的blend文件"),
                SettingDescriptor::new("frames", SettingType::String)
                    .required()
                    .with_description("帧范围，例如 1-30,40-50"),
                SettingDescriptor::new("chunk_size", SettingType::Int32)
                    .with_default(json!(1))
                    .with_description("每个渲染任务包含的帧数"),
                SettingDescriptor::new("render_output_path", SettingType::String)
                    .required()
                    .with_description("渲染输出路径，包含帧号占位符"),
                SettingDescriptor::new("format", SettingType::String).required(),
                SettingDescriptor::new("fps", SettingType::Float),
                SettingDescriptor::new("output_file_extension", SettingType::String),
            ],
        }
    }

    fn compile(&self, job: &mut AuthoredJob) -> ManagerResult<()> {
        let settings = RenderSettings::from_job(job)?;

        let render_tasks = author_render_tasks(job, &settings)?;
        if let Some(video_task) = author_create_video_task(&settings) {
            let video = job.add_task(video_task);
            for render_task in render_tasks {
                job.add_dependency(video, render_task)?;
            }
        }
        Ok(())
    }
}

struct RenderSettings {
    blender_cmd: String,
    filepath: String,
    frames: String,
    chunk_size: usize,
    render_output_path: String,
    format: String,
    fps: Option<f64>,
    output_file_extension: Option<String>,
}

impl RenderSettings {
    fn from_job(job: &AuthoredJob) -> ManagerResult<Self> {
        let get_str = |key: &str| job.settings.get(key).and_then(|v| v.as_str());
        let require_str = |key: &str| {
            get_str(key)
                .map(str::to_string)
                .ok_or_else(|| ManagerError::InvalidJobSettings(format!("缺少必填设置: {key}")))
        };

        let chunk_size = job
            .settings
            .get("chunk_size")
            .and_then(|v| v.as_i64())
            .unwrap_or(1);
        let chunk_size = usize::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                ManagerError::InvalidJobSettings(format!("chunk_size必须大于0: {chunk_size}"))
            })?;

        Ok(Self {
            blender_cmd: require_str("blender_cmd")?,
            filepath: require_str("filepath")?,
            frames: require_str("frames")?,
            chunk_size,
            render_output_path: require_str("render_output_path")?,
            format: require_str("format")?,
            fps: job.settings.get("fps").and_then(|v| v.as_f64()),
            output_file_extension: get_str("output_file_extension")
                .filter(|ext| !ext.is_empty())
                .map(str::to_string),
        })
    }

    /// 渲染输出所在目录
    fn render_dir(&self) -> &str {
        parent_dir(&self.render_output_path)
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn parent_dir(path: &str) -> &str {
    match path.rfind(is_separator) {
        Some(0) => &path[..1],
        Some(idx) => &path[..idx],
        None => ".",
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit(is_separator).next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

fn author_render_tasks(
    job: &mut AuthoredJob,
    settings: &RenderSettings,
) -> ManagerResult<Vec<super::TaskIndex>> {
    let chunks = chunk_frames(&settings.frames, settings.chunk_size)?;

    let mut render_tasks = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let command = Command::new(
            "blender-render",
            json!({
                "exe": settings.blender_cmd,
                "blendfile": settings.filepath,
                "args": [
                    "--render-output", settings.render_output_path,
                    "--render-format", settings.format,
                    "--render-frame", chunk.replace('-', ".."),
                ],
            }),
        );
        let task = AuthoredTask::new(format!("render-{chunk}"), "blender").with_command(command);
        render_tasks.push(job.add_task(task));
    }
    Ok(render_tasks)
}

fn author_create_video_task(settings: &RenderSettings) -> Option<AuthoredTask> {
    if FFMPEG_INCOMPATIBLE_IMAGE_FORMATS.contains(&settings.format.as_str()) {
        return None;
    }
    let fps = settings.fps.filter(|fps| *fps > 0.0)?;
    let extension = settings.output_file_extension.as_deref()?;

    let render_dir = settings.render_dir();
    let stem = file_stem(&settings.filepath).replace(".flamenco", "");
    let output_file = format!("{render_dir}/{stem}-{}.mp4", settings.frames);

    let command = Command::new(
        "frames-to-video",
        json!({
            "exe": "{ffmpeg}",
            "fps": fps,
            "inputGlob": format!("{render_dir}/*{extension}"),
            "outputFile": output_file,
            "args": ["-c:v", "h264", "-crf", "20", "-g", "18", "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"],
        }),
    );
    Some(AuthoredTask::new("create-video", "ffmpeg").with_command(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dir_and_stem() {
        assert_eq!(parent_dir("/render/shot/######"), "/render/shot");
        assert_eq!(parent_dir("/frame"), "/");
        assert_eq!(parent_dir("frame"), ".");
        assert_eq!(file_stem("/projects/shot.flamenco.blend"), "shot.flamenco");
        assert_eq!(file_stem("C:\\proj\\shot.blend"), "shot");
    }
}
