use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use renderfarm_core::{ManagerError, ManagerResult};

/// 作业设置项的值类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    String,
    Int32,
    Float,
    Bool,
}

impl SettingType {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            SettingType::String => value.is_string(),
            SettingType::Int32 => value
                .as_i64()
                .map(|v| i32::try_from(v).is_ok())
                .unwrap_or(false),
            SettingType::Float => value.is_number(),
            SettingType::Bool => value.is_boolean(),
        }
    }
}

/// 单个作业设置项的描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingDescriptor {
    pub key: String,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_visible() -> bool {
    true
}

impl SettingDescriptor {
    pub fn new(key: impl Into<String>, setting_type: SettingType) -> Self {
        Self {
            key: key.into(),
            setting_type,
            default: None,
            required: false,
            visible: true,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 作业类型描述：可机器读取的设置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTypeDescriptor {
    pub name: String,
    pub label: String,
    pub settings: Vec<SettingDescriptor>,
}

impl JobTypeDescriptor {
    /// 描述内容的哈希值，描述变化时etag随之变化
    pub fn etag(&self) -> ManagerResult<String> {
        let as_bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&as_bytes)))
    }

    /// 补全默认值并校验必填项与类型
    pub fn apply_to_settings(
        &self,
        settings: &mut serde_json::Map<String, serde_json::Value>,
    ) -> ManagerResult<()> {
        for setting in &self.settings {
            match settings.get(&setting.key) {
                Some(value) if !value.is_null() => {
                    if !setting.setting_type.accepts(value) {
                        return Err(ManagerError::InvalidJobSettings(format!(
                            "设置 {} 应为 {:?} 类型，实际为 {}",
                            setting.key, setting.setting_type, value
                        )));
                    }
                }
                _ => {
                    if let Some(default) = &setting.default {
                        settings.insert(setting.key.clone(), default.clone());
                    } else if setting.required {
                        return Err(ManagerError::InvalidJobSettings(format!(
                            "缺少必填设置: {}",
                            setting.key
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// 对外提供的作业类型信息，包含etag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTypeInfo {
    #[serde(flatten)]
    pub descriptor: JobTypeDescriptor,
    pub etag: String,
}
