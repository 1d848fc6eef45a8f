use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown value for {field}: {value}")]
pub struct InvalidEnum {
    pub field: String,
    pub value: String,
}

/// Macro to generate an index-ordered label enum with as_str + FromStr.
///
/// Variant order is the model's output order: the n-th variant is the
/// label of output column n.
macro_rules! label_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            /// Output column of this label.
            pub fn index(&self) -> usize {
                *self as usize
            }

            pub fn from_index(index: usize) -> Option<Self> {
                Self::ALL.get(index).copied()
            }

            pub fn count() -> usize {
                Self::ALL.len()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

label_enum!(DiagnosticClass {
    BrainHemorrhage => "Brain_Hemorrhage",
    BrainNormal => "Brain_Normal",
    BrainTumor => "Brain_Tumor",
    ChestPneumonia => "Chest_PNEUMONIA",
    ChestXrayNormal => "Chest_Xray_Normal",
    KidneyNormal => "Kidney_Normal",
    KidneyStone => "Kidney_Stone",
    KidneyTumor => "Kidney_Tumor",
    KneeNormal => "Knee_Normal",
    KneeOsteoarthritis => "Knee_Osteoarthritis",
    LungCancer => "Lung_Cancer",
    LungsNormal => "Lungs_Normal",
    LungsTb => "Lungs_TB",
    NoLungCancer => "No_Lung_Cancer",
});
