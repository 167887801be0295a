//! Message and packet templates.
//!
//! Every wire shape is a static `Template`: an ordered field list with
//! declared bit widths, default values, and the sub-packets the message
//! may carry. A parallel `NID → Template` table drives dynamic dispatch
//! on the receive path; builders address templates by name.
//!
//! Widths are chosen so that every sub-packet and repeated-section
//! block begins on a byte boundary of the packed stream — the decode
//! side aligns before reading them, the encode side never pads.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;

use crate::error::TemplateError;
use crate::message::Fields;

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub bits: u8,
    /// Repeated fields are emitted `N_ITER` times, one copy per entry
    /// of the `sections` array; the `_k` suffix is stripped on access.
    pub repeated: bool,
}

const fn f(name: &'static str, bits: u8) -> FieldSpec {
    FieldSpec { name, bits, repeated: false }
}

const fn rep(name: &'static str, bits: u8) -> FieldSpec {
    FieldSpec { name, bits, repeated: true }
}

#[derive(Debug)]
pub struct Template {
    pub nid: u8,
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
    pub sub_packets: &'static [&'static str],
    pub defaults: &'static [(&'static str, u64)],
}

impl Template {
    /// Defaults as a value map, ready to merge with overrides.
    pub fn default_values(&self) -> Fields {
        let mut m = Fields::new();
        for (k, v) in self.defaults {
            m.insert((*k).into(), Value::from(*v));
        }
        m
    }

    pub fn default_of(&self, name: &str) -> Option<u64> {
        self.defaults.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.fields.iter().any(|fs| fs.name == name)
    }

    /// For packet templates: the NID_PACKET value the decoder peeks for.
    pub fn expected_nid_packet(&self) -> Option<u64> {
        self.default_of("NID_PACKET")
    }
}

/// Current system version carried in Packet 2 (X.Y packed as X*16+Y).
pub const M_VERSION: u64 = 33;

// ── Packet templates ─────────────────────────────────────────────────

static PACKET0: Template = Template {
    nid: 0,
    name: "packet0",
    fields: &[
        f("NID_PACKET", 8),
        f("L_PACKET", 13),
        f("Q_SCALE", 2),
        f("D_LRBG", 15),
        f("Q_DIRLRBG", 2),
        f("V_TRAIN", 7),
    ],
    sub_packets: &[],
    defaults: &[("NID_PACKET", 0), ("L_PACKET", 47), ("Q_SCALE", 1)],
};

static PACKET2: Template = Template {
    nid: 2,
    name: "packet2",
    fields: &[f("NID_PACKET", 8), f("L_PACKET", 13), f("M_VERSION", 7)],
    sub_packets: &[],
    defaults: &[("NID_PACKET", 2), ("L_PACKET", 28), ("M_VERSION", M_VERSION)],
};

static PACKET15: Template = Template {
    nid: 15,
    name: "packet15",
    fields: &[
        // fixed prefix: 48 bits, keeps the section block byte-aligned
        f("NID_PACKET", 8),
        f("L_PACKET", 13),
        f("Q_DIR", 2),
        f("Q_SCALE", 2),
        f("V_EMA", 7),
        f("T_EMA", 10),
        f("N_ITER", 6),
        // per-section group: 46 bits, N_ITER copies
        rep("L_SECTION_k", 16),
        rep("Q_SECTIONTIMER_k", 1),
        rep("T_SECTIONTIMER_k", 13),
        rep("D_SECTIONTIMERSTOPLOC_k", 16),
        // end-section block: 48 bits, after the last section
        f("L_ENDSECTION", 16),
        f("Q_ENDTIMER", 2),
        f("T_ENDTIMER", 14),
        f("D_ENDTIMERSTARTLOC", 16),
    ],
    sub_packets: &[],
    defaults: &[("NID_PACKET", 15), ("Q_SCALE", 1), ("V_EMA", 80), ("T_EMA", 1023)],
};

// ── Message templates ────────────────────────────────────────────────

macro_rules! base {
    () => {
        f("NID_MESSAGE", 8)
    };
}

static MSG_155: Template = Template {
    nid: 155,
    name: "session_establish",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("NID_ENGINE", 24)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 155), ("L_MESSAGE", 10), ("NID_ENGINE", 0x0001)],
};

static MSG_32: Template = Template {
    nid: 32,
    name: "system_version",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &["packet2"],
    defaults: &[("NID_MESSAGE", 32), ("L_MESSAGE", 11)],
};

static MSG_146: Template = Template {
    nid: 146,
    name: "ack",
    fields: &[
        base!(),
        f("L_MESSAGE", 16),
        f("T_TRAIN", 32),
        f("T_TRAIN_ack", 32),
        f("NID_MESSAGE_REF", 8),
    ],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 146), ("L_MESSAGE", 12)],
};

static MSG_154: Template = Template {
    nid: 154,
    name: "version_reject",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("M_VERSION", 8)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 154), ("L_MESSAGE", 8)],
};

static MSG_38: Template = Template {
    nid: 38,
    name: "session_ack",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 38), ("L_MESSAGE", 7)],
};

static MSG_159: Template = Template {
    nid: 159,
    name: "keys_auth",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("NID_ENGINE", 24)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 159), ("L_MESSAGE", 10), ("NID_ENGINE", 0x0001)],
};

static MSG_129: Template = Template {
    nid: 129,
    name: "train_data",
    fields: &[
        base!(),
        f("L_MESSAGE", 16),
        f("T_TRAIN", 32),
        f("L_TRAIN", 16),
        f("V_MAXTRAIN", 8),
        f("N_AXLE", 16),
    ],
    sub_packets: &[],
    defaults: &[
        ("NID_MESSAGE", 129),
        ("L_MESSAGE", 12),
        ("L_TRAIN", 400),
        ("V_MAXTRAIN", 140),
        ("N_AXLE", 16),
    ],
};

static MSG_8: Template = Template {
    nid: 8,
    name: "train_data_ack",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("T_TRAIN_ack", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 8), ("L_MESSAGE", 11)],
};

static MSG_157: Template = Template {
    nid: 157,
    name: "train_acceptance",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &["packet0"],
    defaults: &[("NID_MESSAGE", 157), ("L_MESSAGE", 13)],
};

static MSG_41: Template = Template {
    nid: 41,
    name: "train_accepted",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 41), ("L_MESSAGE", 7)],
};

static MSG_132: Template = Template {
    nid: 132,
    name: "ma_request",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("Q_MARQSTREASON", 8)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 132), ("L_MESSAGE", 8), ("Q_MARQSTREASON", 1)],
};

static MSG_3: Template = Template {
    nid: 3,
    name: "movement_authority",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("M_ACK", 8)],
    sub_packets: &["packet15"],
    defaults: &[("NID_MESSAGE", 3), ("L_MESSAGE", 20), ("M_ACK", 1)],
};

static MSG_136: Template = Template {
    nid: 136,
    name: "position_report",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &["packet0"],
    defaults: &[("NID_MESSAGE", 136), ("L_MESSAGE", 13)],
};

static MSG_150: Template = Template {
    nid: 150,
    name: "end_of_mission",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 150), ("L_MESSAGE", 7)],
};

static MSG_156: Template = Template {
    nid: 156,
    name: "terminate_session",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 156), ("L_MESSAGE", 7)],
};

static MSG_39: Template = Template {
    nid: 39,
    name: "termination_ack",
    fields: &[base!(), f("L_MESSAGE", 16), f("T_TRAIN", 32), f("T_TRAIN_ack", 32)],
    sub_packets: &[],
    defaults: &[("NID_MESSAGE", 39), ("L_MESSAGE", 11)],
};

// ── Registry ─────────────────────────────────────────────────────────

pub struct TemplateSet {
    by_nid: HashMap<u8, &'static Template>,
    by_name: HashMap<&'static str, &'static Template>,
    packets: HashMap<&'static str, &'static Template>,
}

impl TemplateSet {
    pub fn by_nid(&self, nid: u8) -> Result<&'static Template, TemplateError> {
        self.by_nid.get(&nid).copied().ok_or(TemplateError::Missing { nid })
    }

    pub fn by_name(&self, name: &str) -> Result<&'static Template, TemplateError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TemplateError::MissingByName { name: name.into() })
    }

    pub fn packet(&self, name: &str) -> Option<&'static Template> {
        self.packets.get(name).copied()
    }

    pub fn nids(&self) -> impl Iterator<Item = u8> + '_ {
        self.by_nid.keys().copied()
    }
}

/// The process-wide template table.
pub fn registry() -> &'static TemplateSet {
    static SET: OnceLock<TemplateSet> = OnceLock::new();
    SET.get_or_init(|| {
        let messages: [&'static Template; 16] = [
            &MSG_3, &MSG_8, &MSG_32, &MSG_38, &MSG_39, &MSG_41, &MSG_129, &MSG_132, &MSG_136,
            &MSG_146, &MSG_150, &MSG_154, &MSG_155, &MSG_156, &MSG_157, &MSG_159,
        ];
        let mut by_nid = HashMap::new();
        let mut by_name = HashMap::new();
        for t in messages {
            by_nid.insert(t.nid, t);
            by_name.insert(t.name, t);
        }
        let mut packets = HashMap::new();
        for p in [&PACKET0, &PACKET2, &PACKET15] {
            packets.insert(p.name, p as &'static Template);
        }
        TemplateSet { by_nid, by_name, packets }
    })
}
