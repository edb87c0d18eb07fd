use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;


/// Ownership of a resource. A task reserves its resource when it is
/// admitted, occupies it once the process is running and releases it when
/// the task ends.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResourceState {
    #[default]
    Free,
    Reserved(Uuid),
    Busy(Uuid),
}

impl ResourceState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, ResourceState::Free)
    }

    pub fn task(&self) -> Option<Uuid> {
        match self {
            ResourceState::Free => None,
            ResourceState::Reserved(task) | ResourceState::Busy(task) => Some(*task),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ResourceState::Free => "free",
            ResourceState::Reserved(_) => "reserved",
            ResourceState::Busy(_) => "busy",
        }
    }
}


#[derive(Clone, Debug)]
pub struct Resource {
    pub name: String,
    pub state: ResourceState,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: ResourceState::Free }
    }

    pub fn short_name(&self) -> &str {
        self.name.strip_prefix("/dev/").unwrap_or(&self.name)
    }

    pub fn view(&self) -> ResourceView {
        ResourceView {
            name: self.name.clone(),
            short_name: self.short_name().to_string(),
            busy: self.state.is_busy(),
            state: self.state.label().to_string(),
            task: self.state.task(),
        }
    }
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub name: String,
    pub short_name: String,
    pub busy: bool,
    pub state: String,
    pub task: Option<Uuid>,
}


/// The resources currently known to the scheduler, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct Fleet {
    resources: Vec<Resource>,
}

impl Fleet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fleet = Self::default();
        fleet.replace(names.into_iter().map(Into::into).collect());
        fleet
    }

    pub fn list(&self) -> &[Resource] {
        &self.resources
    }

    pub fn views(&self) -> Vec<ResourceView> {
        self.resources.iter().map(Resource::view).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Finds a resource by full name or by name without the `/dev/` prefix.
    pub fn find(&self, name: &str) -> Option<&Resource> {
        self.get(name)
            .or_else(|| self.resources.iter().find(|r| r.short_name() == name))
    }

    pub fn is_free(&self, name: &str) -> bool {
        self.get(name).is_some_and(|r| r.state == ResourceState::Free)
    }

    pub fn reserve(&mut self, name: &str, task: Uuid) -> Result<(), Error> {
        let resource = self.get_mut(name)?;
        if resource.state != ResourceState::Free {
            return Err(Error::ResourceBusy(name.to_string()));
        }
        resource.state = ResourceState::Reserved(task);
        Ok(())
    }

    /// Moves a reservation held by `task` to busy.
    pub fn occupy(&mut self, name: &str, task: Uuid) -> bool {
        match self.get_mut(name) {
            Ok(resource) if resource.state == ResourceState::Reserved(task) => {
                resource.state = ResourceState::Busy(task);
                true
            }
            _ => false,
        }
    }

    /// Frees the resource if `task` holds it.
    pub fn release(&mut self, name: &str, task: Uuid) -> bool {
        match self.get_mut(name) {
            Ok(resource) if resource.state.task() == Some(task) => {
                resource.state = ResourceState::Free;
                true
            }
            _ => false,
        }
    }

    /// Replaces the set of resources, keeping the state of the ones that are
    /// still present. Returns the names that were added.
    pub fn replace(&mut self, names: Vec<String>) -> Vec<String> {
        self.resources.retain(|r| names.contains(&r.name));

        let mut added = vec![];
        for name in names {
            if self.get(&name).is_none() {
                self.resources.push(Resource::new(name.clone()));
                added.push(name);
            }
        }
        added
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Resource, Error> {
        self.resources
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_lifecycle() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        let task = Uuid::new_v4();

        fleet.reserve("/dev/sda", task).unwrap();
        assert!(fleet.get("/dev/sda").unwrap().state.is_busy());
        assert!(fleet.occupy("/dev/sda", task));
        assert_eq!(fleet.get("/dev/sda").unwrap().state, ResourceState::Busy(task));
        assert!(fleet.release("/dev/sda", task));
        assert!(fleet.is_free("/dev/sda"));
    }

    #[test]
    fn reserve_rejects_busy_and_unknown() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        fleet.reserve("/dev/sda", Uuid::new_v4()).unwrap();

        assert!(matches!(
            fleet.reserve("/dev/sda", Uuid::new_v4()),
            Err(Error::ResourceBusy(_))
        ));
        assert!(matches!(
            fleet.reserve("/dev/sdb", Uuid::new_v4()),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn release_by_other_task_is_ignored() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        let owner = Uuid::new_v4();
        fleet.reserve("/dev/sda", owner).unwrap();

        assert!(!fleet.release("/dev/sda", Uuid::new_v4()));
        assert!(!fleet.occupy("/dev/sda", Uuid::new_v4()));
        assert_eq!(fleet.get("/dev/sda").unwrap().state, ResourceState::Reserved(owner));
    }

    #[test]
    fn replace_keeps_existing_state() {
        let mut fleet = Fleet::new(["/dev/sda", "/dev/sdb"]);
        let task = Uuid::new_v4();
        fleet.reserve("/dev/sdb", task).unwrap();

        let added = fleet.replace(vec!["/dev/sdb".into(), "/dev/sdc".into()]);

        assert_eq!(added, vec!["/dev/sdc".to_string()]);
        let names: Vec<_> = fleet.list().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["/dev/sdb", "/dev/sdc"]);
        assert_eq!(fleet.get("/dev/sdb").unwrap().state, ResourceState::Reserved(task));
    }

    #[test]
    fn find_accepts_short_names() {
        let fleet = Fleet::new(["/dev/sda"]);
        assert_eq!(fleet.find("sda").unwrap().name, "/dev/sda");
        assert_eq!(fleet.find("/dev/sda").unwrap().short_name(), "sda");
        assert!(fleet.find("sdb").is_none());
    }

    #[test]
    fn view_serializes_camel_case() {
        let fleet = Fleet::new(["/dev/sda"]);
        let value = serde_json::to_value(fleet.views()).unwrap();
        assert_eq!(value[0]["shortName"], "sda");
        assert_eq!(value[0]["busy"], false);
        assert_eq!(value[0]["state"], "free");
        assert!(value[0]["task"].is_null());
    }
}
