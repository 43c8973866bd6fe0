//! Certificate hierarchy builder
//!
//! Reconstructs issuer trees from an unordered certificate set. Self-signed
//! certificates seed the forest; remaining certificates attach to whichever
//! node actually issued them (name linkage plus signature check), so a root
//! with several sub-CAs becomes a genuine multi-child tree. Certificates whose
//! issuer is absent from the set end up as additional roots rather than being
//! dropped.
//!
//! The hierarchy is a derived view: rebuilt from the bundle on demand, never
//! mutated in place.

use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::types::{CertError, CertificateHashData};

pub struct CertificateNode {
    pub certificate: Certificate,
    /// Hash data computed against the actual issuer (own key for roots).
    pub hash: CertificateHashData,
    pub children: Vec<CertificateNode>,
}

pub struct CertificateHierarchy {
    roots: Vec<CertificateNode>,
}

impl CertificateHierarchy {
    /// Build the forest for an unordered certificate set.
    ///
    /// Certificates whose hash data cannot be computed are skipped with a
    /// warning; quadratic matching is fine at the tens-of-certificates scale
    /// this store operates on.
    pub fn build(certificates: Vec<Certificate>) -> Self {
        let mut roots: Vec<CertificateNode> = Vec::new();
        let mut pending: Vec<Certificate> = Vec::new();

        for cert in certificates {
            if cert.is_self_signed() {
                match cert.proxy_hash_data() {
                    Ok(hash) => roots.push(CertificateNode {
                        certificate: cert,
                        hash,
                        children: Vec::new(),
                    }),
                    Err(e) => warn!(error = %e, "skipping root certificate without hash data"),
                }
            } else {
                pending.push(cert);
            }
        }

        // Attach until a full pass makes no progress.
        loop {
            let mut attached = false;

            pending.retain(|cert| {
                for root in roots.iter_mut() {
                    if attach(root, cert) {
                        attached = true;
                        return false;
                    }
                }
                true
            });

            if !attached {
                break;
            }
        }

        // Leftovers have no issuer in the set: best-effort roots.
        for cert in pending {
            match cert.proxy_hash_data() {
                Ok(hash) => {
                    debug!(
                        subject = cert.common_name().unwrap_or_default(),
                        "certificate has no issuer in the set, keeping as orphan root"
                    );
                    roots.push(CertificateNode {
                        certificate: cert,
                        hash,
                        children: Vec::new(),
                    });
                }
                Err(e) => warn!(error = %e, "skipping orphan certificate without hash data"),
            }
        }

        Self { roots }
    }

    /// Convenience for the common "trust anchors plus leaf chain" case.
    ///
    /// Sub-CAs frequently appear in both sets (the trust bundle and an
    /// installed chain file); duplicates are merged so each certificate
    /// occupies one node, with the trust-anchor copy winning.
    pub fn build_with_leaves(
        ca_certificates: Vec<Certificate>,
        leaf_certificates: Vec<Certificate>,
    ) -> Self {
        let mut all = ca_certificates;
        for cert in leaf_certificates {
            if !all.iter().any(|existing| existing.same_certificate(&cert)) {
                all.push(cert);
            }
        }
        Self::build(all)
    }

    pub fn roots(&self) -> &[CertificateNode] {
        &self.roots
    }

    /// Depth-first pre-order visit of everything below `node` (the node
    /// itself excluded). Parents are always visited before their children.
    pub fn for_each_descendant<F: FnMut(&CertificateNode, usize)>(
        node: &CertificateNode,
        visit: &mut F,
    ) {
        fn walk<F: FnMut(&CertificateNode, usize)>(node: &CertificateNode, depth: usize, visit: &mut F) {
            for child in &node.children {
                visit(child, depth);
                walk(child, depth + 1, visit);
            }
        }
        walk(node, 1, visit);
    }

    fn find_node(&self, hash: &CertificateHashData) -> Option<&CertificateNode> {
        fn search<'a>(
            node: &'a CertificateNode,
            hash: &CertificateHashData,
        ) -> Option<&'a CertificateNode> {
            if node.hash.matches(hash) {
                return Some(node);
            }
            node.children.iter().find_map(|c| search(c, hash))
        }

        self.roots.iter().find_map(|r| search(r, hash))
    }

    pub fn contains_hash(&self, hash: &CertificateHashData) -> bool {
        self.find_node(hash).is_some()
    }

    /// Certificate identified by `hash`, or `NotFound`.
    pub fn find_certificate(&self, hash: &CertificateHashData) -> Result<&Certificate, CertError> {
        self.find_node(hash)
            .map(|n| &n.certificate)
            .ok_or(CertError::NotFound)
    }

    /// Hash data of `certificate` as positioned in this hierarchy, i.e.
    /// computed with the real issuer key where one is present.
    pub fn certificate_hash(
        &self,
        certificate: &Certificate,
    ) -> Result<CertificateHashData, CertError> {
        fn search(node: &CertificateNode, wanted: &Certificate) -> Option<CertificateHashData> {
            if node.certificate.same_certificate(wanted) {
                return Some(node.hash.clone());
            }
            node.children.iter().find_map(|c| search(c, wanted))
        }

        self.roots
            .iter()
            .find_map(|r| search(r, certificate))
            .ok_or(CertError::NotFound)
    }

    /// Everything transitively issued by `certificate`, parent-before-child.
    pub fn collect_descendants(&self, certificate: &Certificate) -> Vec<Certificate> {
        fn locate<'a>(node: &'a CertificateNode, wanted: &Certificate) -> Option<&'a CertificateNode> {
            if node.certificate.same_certificate(wanted) {
                return Some(node);
            }
            node.children.iter().find_map(|c| locate(c, wanted))
        }

        let mut collected = Vec::new();
        if let Some(node) = self.roots.iter().find_map(|r| locate(r, certificate)) {
            Self::for_each_descendant(node, &mut |child, _| {
                collected.push(child.certificate.clone());
            });
        }
        collected
    }

    /// Root certificate above `certificate`, if it sits in any tree whose root
    /// is self-signed.
    pub fn find_root_of(&self, certificate: &Certificate) -> Option<&Certificate> {
        for root in &self.roots {
            if root.certificate.same_certificate(certificate) {
                return Some(&root.certificate);
            }
            let mut found = false;
            Self::for_each_descendant(root, &mut |child, _| {
                if child.certificate.same_certificate(certificate) {
                    found = true;
                }
            });
            if found {
                return Some(&root.certificate);
            }
        }
        None
    }

    /// Indented textual dump for trace logging.
    pub fn to_debug_string(&self) -> String {
        fn dump(node: &CertificateNode, depth: usize, out: &mut String) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.certificate.common_name().unwrap_or_else(|| "<no CN>".into()));
            out.push('\n');
            for child in &node.children {
                dump(child, depth + 1, out);
            }
        }

        let mut out = String::new();
        for root in &self.roots {
            dump(root, 0, &mut out);
        }
        out
    }
}

/// Try to hang `cert` below `node` or any of its descendants.
fn attach(node: &mut CertificateNode, cert: &Certificate) -> bool {
    if cert.is_issued_by(&node.certificate) {
        match cert.hash_data_with_issuer(&node.certificate) {
            Ok(hash) => {
                node.children.push(CertificateNode {
                    certificate: cert.clone(),
                    hash,
                    children: Vec::new(),
                });
                return true;
            }
            Err(e) => {
                warn!(error = %e, "could not compute hash data for issued certificate");
                return false;
            }
        }
    }

    node.children.iter_mut().any(|child| attach(child, cert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ca_cert, leaf_cert};

    #[test]
    fn test_linear_chain_visits_descendants_in_order() {
        let (root, root_key) = ca_cert("H Root", None, 365).unwrap();
        let (sub1, sub1_key) = ca_cert("H Sub1", Some((&root, &root_key)), 365).unwrap();
        let (sub2, sub2_key) = ca_cert("H Sub2", Some((&sub1, &sub1_key)), 365).unwrap();
        let (leaf, _) = leaf_cert("H Leaf", &sub2, &sub2_key, 30).unwrap();

        // Deliberately shuffled input.
        let hierarchy =
            CertificateHierarchy::build(vec![leaf.clone(), root.clone(), sub2, sub1]);

        assert_eq!(hierarchy.roots().len(), 1);

        let mut names = Vec::new();
        CertificateHierarchy::for_each_descendant(&hierarchy.roots()[0], &mut |node, _| {
            names.push(node.certificate.common_name().unwrap());
        });
        assert_eq!(names, ["H Sub1", "H Sub2", "H Leaf"]);
    }

    #[test]
    fn test_branching_root_gets_both_subcas() {
        let (root, root_key) = ca_cert("B Root", None, 365).unwrap();
        let (sub_a, sub_a_key) = ca_cert("B SubA", Some((&root, &root_key)), 365).unwrap();
        let (sub_b, sub_b_key) = ca_cert("B SubB", Some((&root, &root_key)), 365).unwrap();
        let (leaf_a, _) = leaf_cert("B LeafA", &sub_a, &sub_a_key, 30).unwrap();
        let (leaf_b, _) = leaf_cert("B LeafB", &sub_b, &sub_b_key, 30).unwrap();

        let hierarchy = CertificateHierarchy::build(vec![
            leaf_b, sub_a.clone(), root.clone(), leaf_a, sub_b.clone(),
        ]);

        assert_eq!(hierarchy.roots().len(), 1);
        let root_node = &hierarchy.roots()[0];
        assert_eq!(root_node.children.len(), 2);
        for child in &root_node.children {
            assert_eq!(child.children.len(), 1);
        }

        let mut visited = 0;
        CertificateHierarchy::for_each_descendant(root_node, &mut |_, _| visited += 1);
        assert_eq!(visited, 4);
    }

    #[test]
    fn test_merged_sets_deduplicate_shared_subcas() {
        let (root, root_key) = ca_cert("M Root", None, 365).unwrap();
        let (sub, sub_key) = ca_cert("M Sub", Some((&root, &root_key)), 365).unwrap();
        let (leaf, _) = leaf_cert("M Leaf", &sub, &sub_key, 30).unwrap();

        // The sub-CA lives in the trust bundle and in the leaf chain.
        let hierarchy = CertificateHierarchy::build_with_leaves(
            vec![root, sub.clone()],
            vec![leaf, sub],
        );

        assert_eq!(hierarchy.roots().len(), 1);
        let mut names = Vec::new();
        CertificateHierarchy::for_each_descendant(&hierarchy.roots()[0], &mut |node, _| {
            names.push(node.certificate.common_name().unwrap());
        });
        assert_eq!(names, ["M Sub", "M Leaf"]);
    }

    #[test]
    fn test_orphans_become_roots() {
        let (root, root_key) = ca_cert("O Root", None, 365).unwrap();
        let (sub, sub_key) = ca_cert("O Sub", Some((&root, &root_key)), 365).unwrap();
        let (leaf, _) = leaf_cert("O Leaf", &sub, &sub_key, 30).unwrap();

        // Root intentionally absent; sub carries the chain, leaf attaches.
        let hierarchy = CertificateHierarchy::build(vec![leaf, sub.clone()]);

        assert_eq!(hierarchy.roots().len(), 1);
        assert!(!hierarchy.roots()[0].certificate.is_self_signed());
        assert_eq!(hierarchy.roots()[0].children.len(), 1);
    }

    #[test]
    fn test_find_by_hash_uses_issuer_key() {
        let (root, root_key) = ca_cert("F Root", None, 365).unwrap();
        let (sub, sub_key) = ca_cert("F Sub", Some((&root, &root_key)), 365).unwrap();
        let (leaf, _) = leaf_cert("F Leaf", &sub, &sub_key, 30).unwrap();

        let hierarchy =
            CertificateHierarchy::build(vec![root.clone(), sub.clone(), leaf.clone()]);

        let leaf_hash = leaf.hash_data_with_issuer(&sub).unwrap();
        let found = hierarchy.find_certificate(&leaf_hash).unwrap();
        assert!(found.same_certificate(&leaf));

        // The proxy hash (own key) must not resolve for an issued certificate.
        let proxy = leaf.proxy_hash_data().unwrap();
        assert!(hierarchy.find_certificate(&proxy).is_err());

        let unknown = CertificateHashData {
            issuer_name_hash: [0; 32],
            issuer_key_hash: [0; 32],
            serial_number: "00".into(),
        };
        assert!(matches!(
            hierarchy.find_certificate(&unknown),
            Err(CertError::NotFound)
        ));
    }

    #[test]
    fn test_root_lookup_from_leaf() {
        let (root, root_key) = ca_cert("R Root", None, 365).unwrap();
        let (sub, sub_key) = ca_cert("R Sub", Some((&root, &root_key)), 365).unwrap();
        let (leaf, _) = leaf_cert("R Leaf", &sub, &sub_key, 30).unwrap();

        let hierarchy = CertificateHierarchy::build(vec![root.clone(), sub, leaf.clone()]);
        let found = hierarchy.find_root_of(&leaf).unwrap();
        assert!(found.same_certificate(&root));
    }
}
