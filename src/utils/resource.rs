use crate::error::KuserResult;
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};

pub(crate) trait KuserResourceExt<T>: kube::Resource + Sized {
    /// Create the object, or merge-patch it if it already exists.
    async fn patch_or_create(&self, api: kube::Api<T>) -> KuserResult<Self>;
}

impl<K> KuserResourceExt<K> for K
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + Serialize + Clone + std::fmt::Debug,
{
    async fn patch_or_create(&self, api: kube::Api<K>) -> KuserResult<Self> {
        let name = self.name_any();
        let meta = api.get_metadata_opt(&name).await?;
        let new_obj = if meta.is_none() {
            tracing::info!(name, kind = K::kind(&()).as_ref(), "Creating");
            api.create(&Default::default(), self).await?
        } else {
            tracing::info!(name, kind = K::kind(&()).as_ref(), "Patching");
            api.patch(&name, &Default::default(), &kube::api::Patch::Merge(self))
                .await?
        };
        Ok(new_obj)
    }
}
