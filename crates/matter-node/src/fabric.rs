//! Fabric 表：管理域凭据的持有、持久化与级联清除。
//!
//! # 生命周期（What）
//! - AddNOC 创建（配网期内先挂为 pending，CommissioningComplete 落定）；
//! - UpdateNOC / UpdateFabricLabel 原位变更；
//! - RemoveFabric 级联：关闭会话、清除持久化子树 `fabrics/<index>`。

use dashmap::DashMap;
use matter_codec_tlv::{Tag, TlvValue};
use matter_core::crypto::{CryptoProvider, OperationalKeypair};
use matter_core::error::{MatterError, Result, codes};
use matter_core::storage::{StorageContext, StorageService};
use matter_core::types::{FabricId, FabricIndex, NodeId, VendorId};
use matter_session::{FabricCredentials, NocChain, OperationalCert};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// 一个 fabric 槽位。
#[derive(Clone)]
pub struct Fabric {
    pub index: FabricIndex,
    pub fabric_id: FabricId,
    pub local_node_id: NodeId,
    pub vendor_id: VendorId,
    pub label: String,
    pub root_cert: OperationalCert,
    pub noc_chain: NocChain,
    pub ipk: [u8; 16],
    pub keypair: Arc<OperationalKeypair>,
    pub case_admin_subject: NodeId,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("index", &self.index)
            .field("fabric_id", &self.fabric_id)
            .field("local_node_id", &self.local_node_id)
            .field("label", &self.label)
            .finish()
    }
}

impl Fabric {
    /// 压缩 fabric 标识：根公钥与 fabric id 派生的 64 位（运营 MDNS
    /// 实例名前半段）。
    pub fn compressed_fabric_id(&self, crypto: &dyn CryptoProvider) -> u64 {
        let mut input = self.root_cert.public_key.to_vec();
        input.extend_from_slice(&self.fabric_id.raw().to_le_bytes());
        let digest = crypto.sha256(&input);
        u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ])
    }

    /// 会话层需要的凭据视图。
    pub fn credentials(&self) -> FabricCredentials {
        FabricCredentials {
            fabric_index: self.index,
            fabric_id: self.fabric_id,
            local_node_id: self.local_node_id,
            root_public_key: self.root_cert.public_key,
            ipk: self.ipk,
            noc_chain: self.noc_chain.clone(),
            keypair: Arc::clone(&self.keypair),
        }
    }

    fn to_tlv(&self) -> TlvValue {
        let mut fields = vec![
            (Tag::Context(0), TlvValue::UnsignedInt(self.fabric_id.raw())),
            (
                Tag::Context(1),
                TlvValue::UnsignedInt(self.local_node_id.raw()),
            ),
            (
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(self.vendor_id.raw())),
            ),
            (Tag::Context(3), TlvValue::Utf8(self.label.clone())),
            (Tag::Context(4), TlvValue::Bytes(self.root_cert.to_tlv())),
            (Tag::Context(5), TlvValue::Bytes(self.noc_chain.noc.to_tlv())),
            (Tag::Context(7), TlvValue::Bytes(self.ipk.to_vec())),
            (
                Tag::Context(8),
                TlvValue::Bytes(self.keypair.to_bytes().to_vec()),
            ),
            (
                Tag::Context(9),
                TlvValue::UnsignedInt(self.case_admin_subject.raw()),
            ),
        ];
        if let Some(icac) = &self.noc_chain.icac {
            fields.push((Tag::Context(6), TlvValue::Bytes(icac.to_tlv())));
        }
        TlvValue::Structure(fields)
    }

    fn from_tlv(index: FabricIndex, value: &TlvValue) -> Result<Self> {
        let u64_field = |tag: u8| value.field(tag).and_then(|v| v.as_u64());
        let bytes_field = |tag: u8| value.field(tag).and_then(|v| v.as_bytes());
        let missing = |what: &str| {
            MatterError::implementation(codes::IO_FAILURE, format!("fabric record missing {what}"))
        };

        let key_bytes = bytes_field(8).ok_or_else(|| missing("keypair"))?;
        let mut secret = [0u8; 32];
        if key_bytes.len() != 32 {
            return Err(missing("keypair length"));
        }
        secret.copy_from_slice(key_bytes);

        let ipk_bytes = bytes_field(7).ok_or_else(|| missing("ipk"))?;
        let mut ipk = [0u8; 16];
        if ipk_bytes.len() != 16 {
            return Err(missing("ipk length"));
        }
        ipk.copy_from_slice(ipk_bytes);

        Ok(Self {
            index,
            fabric_id: FabricId(u64_field(0).ok_or_else(|| missing("fabric id"))?),
            local_node_id: NodeId(u64_field(1).ok_or_else(|| missing("node id"))?),
            vendor_id: VendorId(u64_field(2).ok_or_else(|| missing("vendor id"))? as u16),
            label: value
                .field(3)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            root_cert: OperationalCert::from_tlv(
                bytes_field(4).ok_or_else(|| missing("root cert"))?,
            )?,
            noc_chain: NocChain {
                noc: OperationalCert::from_tlv(bytes_field(5).ok_or_else(|| missing("noc"))?)?,
                icac: bytes_field(6)
                    .map(OperationalCert::from_tlv)
                    .transpose()?,
            },
            ipk,
            keypair: Arc::new(OperationalKeypair::from_bytes(&secret)),
            case_admin_subject: NodeId(u64_field(9).unwrap_or(0)),
        })
    }
}

/// Fabric 仓储：索引分配、持久化与查询。
pub struct FabricManager {
    storage: Arc<dyn StorageService>,
    fabrics: DashMap<u8, Fabric>,
    /// 配网期间待落定的信任根（AddTrustedRootCertificate 与 AddNOC 之间）。
    pending_roots: Mutex<Vec<OperationalCert>>,
}

impl FabricManager {
    const CONTEXT_ROOT: &'static str = "fabrics";

    /// 从持久化恢复全部 fabric 槽位。
    pub fn load(storage: Arc<dyn StorageService>) -> Arc<Self> {
        let manager = Arc::new(Self {
            storage,
            fabrics: DashMap::new(),
            pending_roots: Mutex::new(Vec::new()),
        });
        let root = StorageContext::new(Self::CONTEXT_ROOT);
        for child in manager.storage.contexts(&root) {
            let Ok(index) = child.parse::<u8>() else {
                continue;
            };
            let context = root.child(&child);
            let Some(bytes) = manager.storage.get(&context, "record") else {
                continue;
            };
            match matter_codec_tlv::decode(&bytes)
                .map_err(MatterError::from)
                .and_then(|value| Fabric::from_tlv(FabricIndex(index), &value))
            {
                Ok(fabric) => {
                    manager.fabrics.insert(index, fabric);
                }
                Err(err) => debug!(index, error = %err, "skipping unreadable fabric record"),
            }
        }
        manager
    }

    fn context_for(index: FabricIndex) -> StorageContext {
        StorageContext::new(Self::CONTEXT_ROOT).child(index.raw().to_string())
    }

    /// 分配下一个空闲索引（1 起）。
    pub fn allocate_index(&self) -> Result<FabricIndex> {
        for candidate in 1u8..=254 {
            if !self.fabrics.contains_key(&candidate) {
                return Ok(FabricIndex(candidate));
            }
        }
        Err(MatterError::implementation(
            codes::IO_FAILURE,
            "fabric table exhausted",
        ))
    }

    /// 暂存一张信任根（AddTrustedRootCertificate）。
    pub fn stage_trusted_root(&self, cert: OperationalCert) {
        self.pending_roots.lock().expect("root lock").push(cert);
    }

    /// 取出能为给定 NOC 链验签的暂存信任根。
    pub fn take_root_for_chain(
        &self,
        chain: &NocChain,
        crypto: &dyn CryptoProvider,
    ) -> Option<OperationalCert> {
        let mut roots = self.pending_roots.lock().expect("root lock");
        let position = roots.iter().position(|cert| {
            chain
                .validate(crypto, &cert.public_key, chain.noc.fabric_id)
                .is_ok()
        })?;
        Some(roots.remove(position))
    }

    /// 丢弃全部暂存信任根（failsafe 回滚）。
    pub fn discard_staged_roots(&self) {
        self.pending_roots.lock().expect("root lock").clear();
    }

    pub fn staged_root_count(&self) -> usize {
        self.pending_roots.lock().expect("root lock").len()
    }

    /// 登记并持久化一个 fabric。
    pub fn insert(&self, fabric: Fabric) -> Result<()> {
        let index = fabric.index;
        self.persist(&fabric);
        info!(%index, fabric_id = %fabric.fabric_id, "fabric committed");
        self.fabrics.insert(index.raw(), fabric);
        Ok(())
    }

    fn persist(&self, fabric: &Fabric) {
        self.storage.set(
            &Self::context_for(fabric.index),
            "record",
            matter_codec_tlv::encode(&fabric.to_tlv()),
        );
    }

    /// 移除 fabric 并级联清除其持久化子树。
    pub fn remove(&self, index: FabricIndex) -> Option<Fabric> {
        let removed = self.fabrics.remove(&index.raw()).map(|(_, fabric)| fabric);
        if removed.is_some() {
            self.storage.clear(&Self::context_for(index));
            info!(%index, "fabric removed with cascade");
        }
        removed
    }

    pub fn get(&self, index: FabricIndex) -> Option<Fabric> {
        self.fabrics.get(&index.raw()).map(|entry| entry.clone())
    }

    /// 更新 label 并持久化。
    pub fn update_label(&self, index: FabricIndex, label: String) -> Result<()> {
        let mut entry = self.fabrics.get_mut(&index.raw()).ok_or_else(|| {
            MatterError::protocol(codes::PATH_NOT_FOUND, format!("no fabric at {index}"))
        })?;
        entry.label = label;
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
        Ok(())
    }

    /// 替换 NOC 材料（UpdateNOC），返回旧材料供 failsafe 快照。
    pub fn update_noc(
        &self,
        index: FabricIndex,
        noc_chain: NocChain,
        keypair: Arc<OperationalKeypair>,
    ) -> Result<(NocChain, Arc<OperationalKeypair>)> {
        let mut entry = self.fabrics.get_mut(&index.raw()).ok_or_else(|| {
            MatterError::protocol(codes::PATH_NOT_FOUND, format!("no fabric at {index}"))
        })?;
        let prior = (entry.noc_chain.clone(), Arc::clone(&entry.keypair));
        entry.noc_chain = noc_chain;
        entry.keypair = keypair;
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
        Ok(prior)
    }

    pub fn all(&self) -> Vec<Fabric> {
        self.fabrics.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fabrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fabrics.is_empty()
    }
}

impl matter_core::environment::EnvironmentService for FabricManager {}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::crypto::SoftwareCrypto;
    use matter_core::storage::MemoryStorage;
    use matter_session::{issue_noc, self_signed_root};

    fn sample_fabric(index: u8, crypto: &SoftwareCrypto) -> Fabric {
        let root_keys = crypto.generate_keypair();
        let node_keys = crypto.generate_keypair();
        let root_cert = self_signed_root(crypto, &root_keys, 1);
        let noc = issue_noc(
            crypto,
            &root_keys,
            2,
            FabricId(0x1000 + u64::from(index)),
            NodeId(0x42),
            node_keys.public_key(),
        );
        Fabric {
            index: FabricIndex(index),
            fabric_id: FabricId(0x1000 + u64::from(index)),
            local_node_id: NodeId(0x42),
            vendor_id: VendorId(0xfff1),
            label: format!("home-{index}"),
            root_cert,
            noc_chain: NocChain { noc, icac: None },
            ipk: [index; 16],
            keypair: Arc::new(node_keys),
            case_admin_subject: NodeId(0x1),
        }
    }

    #[test]
    fn fabrics_survive_reload() {
        let crypto = SoftwareCrypto;
        let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::default());
        let manager = FabricManager::load(Arc::clone(&storage));
        manager.insert(sample_fabric(1, &crypto)).expect("insert");
        manager.insert(sample_fabric(2, &crypto)).expect("insert");

        let reloaded = FabricManager::load(storage);
        assert_eq!(reloaded.len(), 2);
        let restored = reloaded.get(FabricIndex(1)).expect("fabric 1");
        assert_eq!(restored.label, "home-1");
        assert_eq!(restored.local_node_id, NodeId(0x42));
    }

    #[test]
    fn remove_cascades_persisted_subtree() {
        let crypto = SoftwareCrypto;
        let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::default());
        let manager = FabricManager::load(Arc::clone(&storage));
        manager.insert(sample_fabric(1, &crypto)).expect("insert");

        assert!(manager.remove(FabricIndex(1)).is_some());
        let reloaded = FabricManager::load(storage);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn index_allocation_skips_occupied() {
        let crypto = SoftwareCrypto;
        let manager = FabricManager::load(Arc::new(MemoryStorage::default()));
        assert_eq!(manager.allocate_index().expect("first"), FabricIndex(1));
        manager.insert(sample_fabric(1, &crypto)).expect("insert");
        assert_eq!(manager.allocate_index().expect("second"), FabricIndex(2));
    }

    #[test]
    fn compressed_fabric_id_is_stable() {
        let crypto = SoftwareCrypto;
        let fabric = sample_fabric(1, &crypto);
        assert_eq!(
            fabric.compressed_fabric_id(&crypto),
            fabric.compressed_fabric_id(&crypto)
        );
    }
}
